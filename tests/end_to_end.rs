//! End-to-end scenarios exercising each component against the others,
//! per spec.md §8's concrete scenario list.

use std::sync::Arc;

use teachdb_storage::btree::BTree;
use teachdb_storage::buffer_manager::BufferManager;
use teachdb_storage::external_sort;
use teachdb_storage::file::File;
use teachdb_storage::operators::{Criterion, Operator, Predicate, PredicateType, Projection, Select, Sort};
use teachdb_storage::page_id::make_page_id;
use teachdb_storage::register::Register;
use teachdb_storage::segment::Segment;
use teachdb_storage::sp_segment::SpSegment;

#[test]
fn btree_survives_many_splits() {
    let bm = Arc::new(BufferManager::new(1024, 64));
    let segment = Segment::new(0, bm);
    let tree: BTree<u64, u64> = BTree::new(segment).unwrap();

    for k in 0..1000u64 {
        tree.insert(k, k).unwrap();
    }
    for k in 0..1000u64 {
        assert_eq!(tree.lookup(k).unwrap(), Some(k));
    }
    assert_eq!(tree.lookup(1000).unwrap(), None);
    assert_eq!(tree.lookup(u64::MAX).unwrap(), None);
}

#[test]
fn tid_is_stable_across_a_relocating_resize() {
    let bm = Arc::new(BufferManager::new(512, 8));
    let records = Segment::new(0, bm.clone());
    let fsi = Segment::new(1, bm);
    let sp = SpSegment::new(records, fsi);

    let original: Vec<u8> = (0..100u8).collect();
    let tid = sp.allocate(100).unwrap();
    sp.write(tid, &original).unwrap();

    sp.resize(tid, 400).unwrap();

    let mut out = vec![0u8; 400];
    let n = sp.read(tid, &mut out).unwrap();
    assert_eq!(n, 400);
    assert_eq!(&out[..100], &original[..]);

    sp.erase(tid).unwrap();
    let mut out2 = vec![0u8; 400];
    assert!(sp.read(tid, &mut out2).is_err() || sp.read(tid, &mut out2).unwrap() == 0);
}

#[test]
fn external_sort_of_the_documented_input() {
    let mut input = File::make_temporary().unwrap();
    let values: Vec<u64> = vec![5, 2, 7, 2, 0, 9, 3, 8, 1, 6];
    let mut buf = Vec::with_capacity(values.len() * 8);
    for v in &values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    input.write_block(0, &buf).unwrap();

    let mut output = File::make_temporary().unwrap();
    external_sort::external_sort(&mut input, values.len(), &mut output, 16).unwrap();

    let mut out_buf = vec![0u8; values.len() * 8];
    output.read_block(0, &mut out_buf).unwrap();
    let sorted: Vec<u64> = out_buf.chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap())).collect();
    assert_eq!(sorted, vec![0, 1, 2, 2, 3, 5, 6, 7, 8, 9]);
}

struct VecScan {
    rows: Vec<Vec<Register>>,
    pos: usize,
}

impl VecScan {
    fn boxed(rows: Vec<Vec<Register>>) -> Box<dyn Operator> {
        Box::new(Self { rows, pos: 0 })
    }
}

impl Operator for VecScan {
    fn open(&mut self) {
        self.pos = 0;
    }
    fn next(&mut self) -> bool {
        if self.pos < self.rows.len() {
            self.pos += 1;
            true
        } else {
            false
        }
    }
    fn get_output(&self) -> Vec<Register> {
        self.rows[self.pos - 1].clone()
    }
    fn close(&mut self) {}
}

#[test]
fn projection_select_sort_pipeline() {
    fn row(id: i64, name: &str, age: i64) -> Vec<Register> {
        vec![Register::from_int(id), Register::from_string(name), Register::from_int(age)]
    }
    let scan = VecScan::boxed(vec![
        row(1, "alice           ", 30),
        row(2, "bob             ", 17),
        row(3, "carol           ", 18),
        row(4, "alice           ", 30),
    ]);

    let select = Box::new(Select::new(scan, Predicate::AttributeInt64 { attr_index: 2, predicate_type: PredicateType::Ge, constant: 18 }));
    let projection = Box::new(Projection::new(select, vec![1, 2]));
    let mut sort = Sort::new(projection, vec![Criterion { attr_index: 1, desc: true }, Criterion { attr_index: 0, desc: false }]);

    sort.open();
    let mut rows = Vec::new();
    while sort.next() {
        rows.push(sort.get_output());
    }
    sort.close();

    assert_eq!(
        rows,
        vec![
            vec![Register::from_string("alice           "), Register::from_int(30)],
            vec![Register::from_string("alice           "), Register::from_int(30)],
            vec![Register::from_string("carol           "), Register::from_int(18)],
        ]
    );
}

#[test]
fn hash_join_multimap_scenario() {
    use teachdb_storage::operators::HashJoin;

    fn row(a: i64, b: &str) -> Vec<Register> {
        vec![Register::from_int(a), Register::from_string(b)]
    }
    fn row2(a: i64, b: i64) -> Vec<Register> {
        vec![Register::from_int(a), Register::from_int(b)]
    }

    let left = VecScan::boxed(vec![row(1, "x               "), row(2, "y               "), row(2, "z               ")]);
    let right = VecScan::boxed(vec![row2(2, 10), row2(3, 20), row2(2, 11)]);

    let mut join = HashJoin::new(left, right, 0, 0);
    join.open();
    let mut rows = Vec::new();
    while join.next() {
        rows.push(join.get_output());
    }
    join.close();

    assert_eq!(rows.len(), 4);
    for expected in [
        vec![Register::from_int(2), Register::from_string("y               "), Register::from_int(2), Register::from_int(10)],
        vec![Register::from_int(2), Register::from_string("y               "), Register::from_int(2), Register::from_int(11)],
        vec![Register::from_int(2), Register::from_string("z               "), Register::from_int(2), Register::from_int(10)],
        vec![Register::from_int(2), Register::from_string("z               "), Register::from_int(2), Register::from_int(11)],
    ] {
        assert!(rows.contains(&expected), "missing row {expected:?}");
    }
}

#[test]
fn two_queue_eviction_prefers_fifo_victim() {
    let bm = BufferManager::new(16, 2);
    let a = make_page_id(0, 0);
    let b = make_page_id(0, 1);
    let c = make_page_id(0, 2);

    bm.unfix_page(bm.fix_page(a, false).unwrap(), false);
    bm.unfix_page(bm.fix_page(b, false).unwrap(), false);
    bm.unfix_page(bm.fix_page(a, false).unwrap(), false);

    assert_eq!(bm.get_lru_list(), vec![a]);
    assert_eq!(bm.get_fifo_list(), vec![b]);

    bm.unfix_page(bm.fix_page(c, false).unwrap(), false);

    assert_eq!(bm.get_fifo_list(), vec![c]);
    assert_eq!(bm.get_lru_list(), vec![a]);
}
