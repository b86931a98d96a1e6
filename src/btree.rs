//! Generic B+tree index over fixed-width keys and values, one page per
//! node, addressed through a shared [`Segment`]. Ported from
//! `examples/original_source/b-tree/include/moderndbs/btree.h`.
//!
//! The original's `ComparatorT` template parameter is never actually
//! invoked anywhere in that header (ordering always uses native `<`/`==`
//! on `KeyT`), so it collapses here into a plain `Ord` bound on `K`
//! rather than a dead generic parameter.
//!
//! Latching follows the source: lookup hand-over-hand with shared
//! fixes, a node's parent unfixed only once its child is fixed, and the
//! `root` mutex released as soon as the first page below (or including,
//! for a one-level tree) the root has been pinned. Insert and erase
//! mutate pages, so both take exclusive fixes throughout — the source
//! takes shared fixes on the erase path, but mutating through a shared
//! latch has no Rust equivalent and is a genuine bug in the original
//! (see DESIGN.md).

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::buffer_manager::FixedPage;
use crate::error::Result;
use crate::segment::Segment;

const NODE_HEADER_SIZE: usize = 4;
const CHILD_SIZE: usize = 8;

/// A key or value the tree can store directly in a page: fixed width,
/// byte-encodable. Implemented for the integer types spec.md's testable
/// properties exercise; add more as needed.
pub trait FixedSize: Copy + Ord {
    const SIZE: usize;
    fn encode(&self, buf: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;
}

impl FixedSize for u64 {
    const SIZE: usize = 8;
    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(buf, *self);
    }
    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_u64(buf)
    }
}

impl FixedSize for i64 {
    const SIZE: usize = 8;
    fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_i64(buf, *self);
    }
    fn decode(buf: &[u8]) -> Self {
        LittleEndian::read_i64(buf)
    }
}

fn node_level(bytes: &[u8]) -> u16 {
    LittleEndian::read_u16(&bytes[0..2])
}

fn set_node_level(bytes: &mut [u8], level: u16) {
    LittleEndian::write_u16(&mut bytes[0..2], level);
}

fn node_count(bytes: &[u8]) -> u16 {
    LittleEndian::read_u16(&bytes[2..4])
}

fn set_node_count(bytes: &mut [u8], count: u16) {
    LittleEndian::write_u16(&mut bytes[2..4], count);
}

fn is_leaf(bytes: &[u8]) -> bool {
    node_level(bytes) == 0
}

fn init_leaf(bytes: &mut [u8]) {
    set_node_level(bytes, 0);
    set_node_count(bytes, 0);
}

fn init_inner(bytes: &mut [u8], level: u16) {
    set_node_level(bytes, level);
    set_node_count(bytes, 1);
}

fn inner_key<K: FixedSize>(bytes: &[u8], i: usize) -> K {
    let off = NODE_HEADER_SIZE + i * K::SIZE;
    K::decode(&bytes[off..off + K::SIZE])
}

/// Routing child for a `lower_bound` result: every key in the `i`-th
/// subtree is strictly less than `keys[i]`, and every key in the
/// `i+1`-th subtree is greater than or equal to it, so an exact match
/// must descend one child further right than a strict inequality does.
fn child_index(idx: usize, found: bool) -> usize {
    if found {
        idx + 1
    } else {
        idx
    }
}

fn inner_child<K: FixedSize>(bytes: &[u8], i: usize, inner_cap: usize) -> u64 {
    let off = NODE_HEADER_SIZE + inner_cap * K::SIZE + i * CHILD_SIZE;
    LittleEndian::read_u64(&bytes[off..off + CHILD_SIZE])
}

fn set_inner_child<K: FixedSize>(bytes: &mut [u8], i: usize, inner_cap: usize, pid: u64) {
    let off = NODE_HEADER_SIZE + inner_cap * K::SIZE + i * CHILD_SIZE;
    LittleEndian::write_u64(&mut bytes[off..off + CHILD_SIZE], pid);
}

fn leaf_key<K: FixedSize>(bytes: &[u8], i: usize) -> K {
    let off = NODE_HEADER_SIZE + i * K::SIZE;
    K::decode(&bytes[off..off + K::SIZE])
}

fn leaf_value<K: FixedSize, V: FixedSize>(bytes: &[u8], leaf_cap: usize, i: usize) -> V {
    let off = NODE_HEADER_SIZE + leaf_cap * K::SIZE + i * V::SIZE;
    V::decode(&bytes[off..off + V::SIZE])
}

/// First index `i` with `get(i) >= key`, plus whether `get(i) == key`.
/// The original's branchless loop reads `keys[lower]` once more after
/// the loop without checking `lower < len` first, which is an
/// out-of-bounds read when every key is less than `key`; this version
/// checks the bound before deciding `found`.
fn lower_bound<K: FixedSize>(len: usize, key: K, get: impl Fn(usize) -> K) -> (usize, bool) {
    if len == 0 {
        return (0, false);
    }
    let mut lower = 0usize;
    let mut n = len;
    while n > 1 {
        let half = n / 2;
        if get(lower + half) < key {
            lower += half;
        }
        n -= half;
    }
    if get(lower) < key {
        lower += 1;
    }
    let found = lower < len && get(lower) == key;
    (lower, found)
}

/// A B+tree index: one [`Segment`] holds every node page, addressed by
/// segment-local page index. `root` is guarded by a mutex so a
/// traversal can read the current root id and pin it before anyone else
/// can move it out from under them.
pub struct BTree<K: FixedSize, V: FixedSize> {
    segment: Segment,
    inner_cap: usize,
    leaf_cap: usize,
    root: Mutex<u64>,
    page_counter: AtomicU64,
    _marker: PhantomData<(K, V)>,
}

impl<K: FixedSize, V: FixedSize> BTree<K, V> {
    pub fn new(segment: Segment) -> Result<Self> {
        let page_size = segment.buffer_manager().page_size();
        let inner_cap = (page_size - NODE_HEADER_SIZE - CHILD_SIZE) / (K::SIZE + CHILD_SIZE);
        let leaf_cap = (page_size - NODE_HEADER_SIZE) / (K::SIZE + V::SIZE);

        let page_counter = AtomicU64::new(0);
        let root_pid = page_counter.fetch_add(1, Ordering::AcqRel);
        let mut root_frame = segment.buffer_manager().fix_page(segment.page_id(root_pid), true)?;
        init_leaf(root_frame.data_mut());
        segment.buffer_manager().unfix_page(root_frame, true);

        Ok(Self {
            segment,
            inner_cap,
            leaf_cap,
            root: Mutex::new(root_pid),
            page_counter,
            _marker: PhantomData,
        })
    }

    fn inner_lower_bound(&self, bytes: &[u8], key: K) -> (usize, bool) {
        let keys_len = node_count(bytes) as usize - 1;
        lower_bound(keys_len, key, |i| inner_key::<K>(bytes, i))
    }

    fn leaf_lower_bound(&self, bytes: &[u8], key: K) -> (usize, bool) {
        let len = node_count(bytes) as usize;
        lower_bound(len, key, |i| leaf_key::<K>(bytes, i))
    }

    pub fn lookup(&self, key: K) -> Result<Option<V>> {
        let bm = self.segment.buffer_manager();
        let mut root_guard = Some(self.root.lock());
        let mut current = bm.fix_page(self.segment.page_id(**root_guard.as_ref().unwrap()), false)?;
        let mut parent: Option<FixedPage> = None;

        while !is_leaf(current.data()) {
            let (idx, found) = self.inner_lower_bound(current.data(), key);
            let next_pid = inner_child::<K>(current.data(), child_index(idx, found), self.inner_cap);
            let next = bm.fix_page(self.segment.page_id(next_pid), false)?;

            root_guard.take();
            if let Some(p) = parent.take() {
                bm.unfix_page(p, false);
            }
            parent = Some(current);
            current = next;
        }
        root_guard.take();

        let (idx, found) = self.leaf_lower_bound(current.data(), key);
        let result = if found { Some(leaf_value::<K, V>(current.data(), self.leaf_cap, idx)) } else { None };

        if let Some(p) = parent.take() {
            bm.unfix_page(p, false);
        }
        bm.unfix_page(current, false);
        Ok(result)
    }

    /// Insert a new separator key and right child into a (possibly just
    /// created) inner node. `lb.second` firing is a case the source
    /// notes does not happen in practice; ported as-is.
    fn insert_split_into_inner(&self, bytes: &mut [u8], key: K, child_pid: u64) {
        let count = node_count(bytes) as usize;
        let keys_len = count - 1;
        let (idx, found) = lower_bound(keys_len, key, |i| inner_key::<K>(bytes, i));
        let kbase = NODE_HEADER_SIZE;
        let cbase = NODE_HEADER_SIZE + self.inner_cap * K::SIZE;

        if found && idx < keys_len {
            let coff = cbase + (idx + 1) * CHILD_SIZE;
            LittleEndian::write_u64(&mut bytes[coff..coff + CHILD_SIZE], child_pid);
            return;
        }

        let tail = keys_len - idx;
        if tail > 0 {
            bytes.copy_within(kbase + idx * K::SIZE..kbase + (idx + tail) * K::SIZE, kbase + (idx + 1) * K::SIZE);
            bytes.copy_within(
                cbase + (idx + 1) * CHILD_SIZE..cbase + (idx + 1 + tail) * CHILD_SIZE,
                cbase + (idx + 2) * CHILD_SIZE,
            );
        }
        key.encode(&mut bytes[kbase + idx * K::SIZE..kbase + idx * K::SIZE + K::SIZE]);
        let coff = cbase + (idx + 1) * CHILD_SIZE;
        LittleEndian::write_u64(&mut bytes[coff..coff + CHILD_SIZE], child_pid);
        set_node_count(bytes, (count + 1) as u16);
    }

    /// Split a full inner node in place; `left` keeps `floor(c/2)+1`
    /// children, `right` gets the remainder, and the key at the split
    /// index rises without being duplicated on either side.
    fn split_inner(&self, left: &mut [u8], right: &mut [u8]) -> K {
        let count = node_count(left) as usize;
        let split_idx = count / 2;
        let kbase = NODE_HEADER_SIZE;
        let cbase = NODE_HEADER_SIZE + self.inner_cap * K::SIZE;

        let split_key = inner_key::<K>(left, split_idx);
        let right_key_count = count.saturating_sub(split_idx + 2);
        let right_child_count = count.saturating_sub(split_idx + 1);

        if right_key_count > 0 {
            right[kbase..kbase + right_key_count * K::SIZE]
                .copy_from_slice(&left[kbase + (split_idx + 1) * K::SIZE..kbase + (split_idx + 1 + right_key_count) * K::SIZE]);
        }
        if right_child_count > 0 {
            right[cbase..cbase + right_child_count * CHILD_SIZE].copy_from_slice(
                &left[cbase + (split_idx + 1) * CHILD_SIZE..cbase + (split_idx + 1 + right_child_count) * CHILD_SIZE],
            );
        }
        set_node_count(right, right_child_count as u16);
        set_node_count(left, (split_idx + 1) as u16);
        split_key
    }

    /// Split a full leaf in place; `left` keeps `ceil(c/2)` entries,
    /// `right` gets the remainder. Unlike the inner-node split, the
    /// separator key stays in the leaf it belongs to, so the correct
    /// separator is the right leaf's first key, not the key at the
    /// split index (see DESIGN.md for why this differs from
    /// `split_inner`'s `floor(c/2)+1` ratio).
    fn split_leaf(&self, left: &mut [u8], right: &mut [u8]) -> K {
        let count = node_count(left) as usize;
        let split_idx = count.div_ceil(2);
        let kbase = NODE_HEADER_SIZE;
        let vbase = NODE_HEADER_SIZE + self.leaf_cap * K::SIZE;
        let right_count = count.saturating_sub(split_idx);

        if right_count > 0 {
            right[kbase..kbase + right_count * K::SIZE]
                .copy_from_slice(&left[kbase + split_idx * K::SIZE..kbase + (split_idx + right_count) * K::SIZE]);
            right[vbase..vbase + right_count * V::SIZE]
                .copy_from_slice(&left[vbase + split_idx * V::SIZE..vbase + (split_idx + right_count) * V::SIZE]);
        }
        set_node_count(right, right_count as u16);
        set_node_count(left, split_idx as u16);

        if right_count > 0 {
            leaf_key::<K>(right, 0)
        } else {
            leaf_key::<K>(left, split_idx - 1)
        }
    }

    fn leaf_insert(&self, bytes: &mut [u8], key: K, value: V) {
        let count = node_count(bytes) as usize;
        let (idx, found) = lower_bound(count, key, |i| leaf_key::<K>(bytes, i));
        let kbase = NODE_HEADER_SIZE;
        let vbase = NODE_HEADER_SIZE + self.leaf_cap * K::SIZE;

        if found && idx < count {
            let off = vbase + idx * V::SIZE;
            value.encode(&mut bytes[off..off + V::SIZE]);
            return;
        }

        let tail = count - idx;
        if tail > 0 {
            bytes.copy_within(kbase + idx * K::SIZE..kbase + (idx + tail) * K::SIZE, kbase + (idx + 1) * K::SIZE);
            bytes.copy_within(vbase + idx * V::SIZE..vbase + (idx + tail) * V::SIZE, vbase + (idx + 1) * V::SIZE);
        }
        key.encode(&mut bytes[kbase + idx * K::SIZE..kbase + idx * K::SIZE + K::SIZE]);
        value.encode(&mut bytes[vbase + idx * V::SIZE..vbase + idx * V::SIZE + V::SIZE]);
        set_node_count(bytes, (count + 1) as u16);
    }

    fn leaf_erase(&self, bytes: &mut [u8], key: K) {
        let count = node_count(bytes) as usize;
        let (idx, found) = lower_bound(count, key, |i| leaf_key::<K>(bytes, i));
        if !found || idx >= count {
            return;
        }
        let kbase = NODE_HEADER_SIZE;
        let vbase = NODE_HEADER_SIZE + self.leaf_cap * K::SIZE;
        let tail = count - idx - 1;
        if tail > 0 {
            bytes.copy_within(kbase + (idx + 1) * K::SIZE..kbase + (idx + 1 + tail) * K::SIZE, kbase + idx * K::SIZE);
            bytes.copy_within(vbase + (idx + 1) * V::SIZE..vbase + (idx + 1 + tail) * V::SIZE, vbase + idx * V::SIZE);
        }
        set_node_count(bytes, (count - 1) as u16);
    }

    /// Insert, splitting eagerly: before descending into a full node,
    /// split it first so the recursive call never has to propagate a
    /// split back up through an already-released latch.
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        let bm = self.segment.buffer_manager();
        let mut root_guard = Some(self.root.lock());
        let mut current_pid = **root_guard.as_ref().unwrap();
        let mut current = bm.fix_page(self.segment.page_id(current_pid), true)?;
        let mut parent: Option<FixedPage> = None;

        while !is_leaf(current.data()) {
            let keys_len = node_count(current.data()) as usize - 1;
            if keys_len >= self.inner_cap {
                let right_pid = self.page_counter.fetch_add(1, Ordering::AcqRel);
                let mut right = bm.fix_page(self.segment.page_id(right_pid), true)?;
                init_inner(right.data_mut(), node_level(current.data()));
                let split_key = self.split_inner(current.data_mut(), right.data_mut());

                match parent.as_mut() {
                    None => {
                        let new_root_pid = self.page_counter.fetch_add(1, Ordering::AcqRel);
                        let mut new_root = bm.fix_page(self.segment.page_id(new_root_pid), true)?;
                        init_inner(new_root.data_mut(), node_level(current.data()) + 1);
                        set_inner_child::<K>(new_root.data_mut(), 0, self.inner_cap, current_pid);
                        self.insert_split_into_inner(new_root.data_mut(), split_key, right_pid);
                        **root_guard.as_mut().unwrap() = new_root_pid;
                        root_guard.take();
                        parent = Some(new_root);
                    }
                    Some(p) => self.insert_split_into_inner(p.data_mut(), split_key, right_pid),
                }

                if key > split_key {
                    bm.unfix_page(current, true);
                    current = right;
                } else {
                    bm.unfix_page(right, true);
                }
            }

            let (idx, found) = self.inner_lower_bound(current.data(), key);
            let next_pid = inner_child::<K>(current.data(), child_index(idx, found), self.inner_cap);
            let next = bm.fix_page(self.segment.page_id(next_pid), true)?;

            root_guard.take();
            if let Some(p) = parent.take() {
                bm.unfix_page(p, true);
            }
            parent = Some(current);
            current = next;
            current_pid = next_pid;
        }

        let count = node_count(current.data()) as usize;
        if count >= self.leaf_cap {
            let right_pid = self.page_counter.fetch_add(1, Ordering::AcqRel);
            let mut right = bm.fix_page(self.segment.page_id(right_pid), true)?;
            init_leaf(right.data_mut());
            let split_key = self.split_leaf(current.data_mut(), right.data_mut());

            match parent.as_mut() {
                None => {
                    let new_root_pid = self.page_counter.fetch_add(1, Ordering::AcqRel);
                    let mut new_root = bm.fix_page(self.segment.page_id(new_root_pid), true)?;
                    init_inner(new_root.data_mut(), 1);
                    set_inner_child::<K>(new_root.data_mut(), 0, self.inner_cap, current_pid);
                    self.insert_split_into_inner(new_root.data_mut(), split_key, right_pid);
                    **root_guard.as_mut().unwrap() = new_root_pid;
                    root_guard.take();
                    parent = Some(new_root);
                }
                Some(p) => self.insert_split_into_inner(p.data_mut(), split_key, right_pid),
            }

            if key > split_key {
                self.leaf_insert(right.data_mut(), key, value);
            } else {
                self.leaf_insert(current.data_mut(), key, value);
            }

            root_guard.take();
            if let Some(p) = parent.take() {
                bm.unfix_page(p, true);
            }
            bm.unfix_page(current, true);
            bm.unfix_page(right, true);
        } else {
            self.leaf_insert(current.data_mut(), key, value);
            root_guard.take();
            if let Some(p) = parent.take() {
                bm.unfix_page(p, true);
            }
            bm.unfix_page(current, true);
        }
        Ok(())
    }

    /// Traverse to the leaf holding `key` and remove it by shifting the
    /// tail down. No merging or rebalancing, per spec.
    pub fn erase(&self, key: K) -> Result<()> {
        let bm = self.segment.buffer_manager();
        let mut root_guard = Some(self.root.lock());
        let mut current = bm.fix_page(self.segment.page_id(**root_guard.as_ref().unwrap()), true)?;
        let mut parent: Option<FixedPage> = None;

        while !is_leaf(current.data()) {
            let (idx, found) = self.inner_lower_bound(current.data(), key);
            let next_pid = inner_child::<K>(current.data(), child_index(idx, found), self.inner_cap);
            let next = bm.fix_page(self.segment.page_id(next_pid), true)?;

            root_guard.take();
            if let Some(p) = parent.take() {
                bm.unfix_page(p, false);
            }
            parent = Some(current);
            current = next;
        }
        root_guard.take();

        self.leaf_erase(current.data_mut(), key);

        if let Some(p) = parent.take() {
            bm.unfix_page(p, false);
        }
        bm.unfix_page(current, true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_manager::BufferManager;
    use std::sync::Arc;

    fn tree(page_size: usize) -> BTree<u64, u64> {
        let bm = Arc::new(BufferManager::new(page_size, 64));
        BTree::new(Segment::new(0, bm)).unwrap()
    }

    #[test]
    fn lookup_on_empty_tree_finds_nothing() {
        let t = tree(1024);
        assert_eq!(t.lookup(42).unwrap(), None);
    }

    #[test]
    fn insert_then_lookup_single_key() {
        let t = tree(1024);
        t.insert(7, 700).unwrap();
        assert_eq!(t.lookup(7).unwrap(), Some(700));
        assert_eq!(t.lookup(8).unwrap(), None);
    }

    #[test]
    fn insert_overwrites_existing_key() {
        let t = tree(1024);
        t.insert(1, 10).unwrap();
        t.insert(1, 20).unwrap();
        assert_eq!(t.lookup(1).unwrap(), Some(20));
    }

    #[test]
    fn insert_across_splits_then_lookup_all() {
        let t = tree(1024);
        for k in 0u64..1000 {
            t.insert(k, k).unwrap();
        }
        for k in 0u64..1000 {
            assert_eq!(t.lookup(k).unwrap(), Some(k));
        }
        assert_eq!(t.lookup(1000).unwrap(), None);
        assert_eq!(t.lookup(u64::MAX).unwrap(), None);
    }

    #[test]
    fn insert_descending_order_still_finds_everything() {
        let t = tree(1024);
        for k in (0u64..500).rev() {
            t.insert(k, k * 2).unwrap();
        }
        for k in 0u64..500 {
            assert_eq!(t.lookup(k).unwrap(), Some(k * 2));
        }
    }

    #[test]
    fn erase_removes_key_without_disturbing_others() {
        let t = tree(1024);
        for k in 0u64..200 {
            t.insert(k, k).unwrap();
        }
        t.erase(100).unwrap();
        assert_eq!(t.lookup(100).unwrap(), None);
        assert_eq!(t.lookup(99).unwrap(), Some(99));
        assert_eq!(t.lookup(101).unwrap(), Some(101));
    }

    #[test]
    fn erase_across_many_splits_leaves_the_rest_intact() {
        let t = tree(1024);
        for k in 0u64..1000 {
            t.insert(k, k).unwrap();
        }
        for k in (0u64..1000).step_by(3) {
            t.erase(k).unwrap();
        }
        for k in 0u64..1000 {
            let expect = if k % 3 == 0 { None } else { Some(k) };
            assert_eq!(t.lookup(k).unwrap(), expect);
        }
    }

    #[test]
    fn lower_bound_contract_on_corner_cases() {
        let keys = [10u64, 20, 30];
        let get = |i: usize| keys[i];
        assert_eq!(lower_bound(0, 5u64, |_: usize| 0u64), (0, false));
        assert_eq!(lower_bound(3, 5u64, get), (0, false));
        assert_eq!(lower_bound(3, 20u64, get), (1, true));
        assert_eq!(lower_bound(3, 25u64, get), (2, false));
        assert_eq!(lower_bound(3, 100u64, get), (3, false));
    }
}
