//! On-page slotted layout: header, slot directory, payload area. Ported
//! from `examples/original_source/slotted-pages/src/slotted_page.cc`,
//! operating on a borrowed page-sized byte slice instead of a
//! `reinterpret_cast`ed struct, and using `copy_within` in place of
//! `memmove`.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Result, StorageError};
use crate::page_id::Tid;

pub const HEADER_SIZE: usize = 12;
pub const SLOT_SIZE: usize = 8;

const REDIRECT_BIT: u64 = 1 << 63;
const REDIRECT_TARGET_BIT: u64 = 1 << 62;
const SIZE_SHIFT: u32 = 40;
// Bits 61..40 inclusive: 22 bits, not 24 (bit 63 is the redirect flag, bit
// 62 is_redirect_target; both must stay out of the size field's mask or
// decoding a live slot with its redirect-target bit set corrupts size).
const SIZE_MASK: u64 = 0x3F_FFFF;
const OFFSET_MASK: u64 = (1 << 40) - 1; // 40 bits

/// The three shapes a slot word can take, per spec.md §6's bit-exact layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Empty,
    Live { offset: u32, size: u32, is_redirect_target: bool },
    Redirect { target: Tid },
}

pub fn decode_slot(value: u64) -> SlotKind {
    if value == 0 {
        SlotKind::Empty
    } else if value & REDIRECT_BIT != 0 {
        SlotKind::Redirect {
            target: value & !REDIRECT_BIT,
        }
    } else {
        SlotKind::Live {
            offset: (value & OFFSET_MASK) as u32,
            size: ((value >> SIZE_SHIFT) & SIZE_MASK) as u32,
            is_redirect_target: value & REDIRECT_TARGET_BIT != 0,
        }
    }
}

fn encode_live(offset: u32, size: u32, is_redirect_target: bool) -> u64 {
    let rt_bit = if is_redirect_target { REDIRECT_TARGET_BIT } else { 0 };
    rt_bit | (((size as u64) & SIZE_MASK) << SIZE_SHIFT) | ((offset as u64) & OFFSET_MASK)
}

pub fn encode_redirect(target: Tid) -> u64 {
    debug_assert!(target < REDIRECT_BIT, "target tid overflows 63 bits");
    REDIRECT_BIT | target
}

fn slot_offset_in(slot_id: u16) -> usize {
    HEADER_SIZE + slot_id as usize * SLOT_SIZE
}

/// Read a slot word directly out of a page buffer without wrapping it,
/// for callers holding only a shared latch on the page.
pub fn read_slot_at(bytes: &[u8], slot_id: u16) -> u64 {
    let off = slot_offset_in(slot_id);
    LittleEndian::read_u64(&bytes[off..off + 8])
}

pub fn slot_kind_at(bytes: &[u8], slot_id: u16) -> SlotKind {
    decode_slot(read_slot_at(bytes, slot_id))
}

pub fn free_space_at(bytes: &[u8]) -> u32 {
    LittleEndian::read_u32(&bytes[8..12])
}

pub fn payload_at(bytes: &[u8], offset: u32, size: u32) -> &[u8] {
    &bytes[offset as usize..(offset + size) as usize]
}

/// A view over one page's bytes, interpreted as header + slot directory +
/// payload. Does not own the bytes: callers hold the `FixedPage` latch.
pub struct SlottedPage<'a> {
    bytes: &'a mut [u8],
}

impl<'a> SlottedPage<'a> {
    /// Initialise a freshly-faulted page's header in place.
    pub fn init(bytes: &'a mut [u8]) -> Self {
        let page_size = bytes.len() as u32;
        let mut page = Self { bytes };
        page.set_slot_count(0);
        page.set_first_free_slot(0);
        page.set_data_start(page_size);
        page.set_free_space(page_size - HEADER_SIZE as u32);
        page
    }

    /// Wrap an already-initialised page's bytes.
    pub fn wrap(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    pub fn slot_count(&self) -> u16 {
        LittleEndian::read_u16(&self.bytes[0..2])
    }

    fn set_slot_count(&mut self, v: u16) {
        LittleEndian::write_u16(&mut self.bytes[0..2], v)
    }

    pub fn first_free_slot(&self) -> u16 {
        LittleEndian::read_u16(&self.bytes[2..4])
    }

    fn set_first_free_slot(&mut self, v: u16) {
        LittleEndian::write_u16(&mut self.bytes[2..4], v)
    }

    pub fn data_start(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes[4..8])
    }

    fn set_data_start(&mut self, v: u32) {
        LittleEndian::write_u32(&mut self.bytes[4..8], v)
    }

    pub fn free_space(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes[8..12])
    }

    fn set_free_space(&mut self, v: u32) {
        LittleEndian::write_u32(&mut self.bytes[8..12], v)
    }

    /// Space between the end of the slot directory and `data_start`: the
    /// region allocate/relocate can use without compacting first.
    pub fn fragmented_free_space(&self) -> u32 {
        self.data_start() - (HEADER_SIZE as u32 + self.slot_count() as u32 * SLOT_SIZE as u32)
    }

    fn slot_offset(&self, slot_id: u16) -> usize {
        HEADER_SIZE + slot_id as usize * SLOT_SIZE
    }

    pub fn read_slot(&self, slot_id: u16) -> u64 {
        let off = self.slot_offset(slot_id);
        LittleEndian::read_u64(&self.bytes[off..off + 8])
    }

    pub fn slot_kind(&self, slot_id: u16) -> SlotKind {
        decode_slot(self.read_slot(slot_id))
    }

    pub(crate) fn write_slot(&mut self, slot_id: u16, value: u64) {
        let off = self.slot_offset(slot_id);
        LittleEndian::write_u64(&mut self.bytes[off..off + 8], value);
    }

    /// Overwrite a slot so it redirects to `target`, for the SP-segment's
    /// grow-by-redirect path.
    pub fn write_redirect_slot(&mut self, slot_id: u16, target: Tid) {
        self.write_slot(slot_id, encode_redirect(target));
    }

    /// Flip a live slot's redirect-target flag in place.
    pub fn mark_redirect_target(&mut self, slot_id: u16, is_target: bool) {
        if let SlotKind::Live { offset, size, .. } = self.slot_kind(slot_id) {
            self.write_slot(slot_id, encode_live(offset, size, is_target));
        }
    }

    pub fn payload(&self, offset: u32, size: u32) -> &[u8] {
        &self.bytes[offset as usize..(offset + size) as usize]
    }

    pub fn payload_mut(&mut self, offset: u32, size: u32) -> &mut [u8] {
        &mut self.bytes[offset as usize..(offset + size) as usize]
    }

    /// Insert a new live slot holding `data_size` bytes, returning its slot
    /// id. Compacts in place first if the fragmented region can't fit it.
    pub fn allocate(&mut self, data_size: u32) -> Result<u16> {
        if data_size + SLOT_SIZE as u32 > self.free_space() {
            return Err(StorageError::NoSpaceOnPage(format!(
                "need {} bytes, have {} free",
                data_size,
                self.free_space()
            )));
        }
        if data_size + SLOT_SIZE as u32 > self.fragmented_free_space() {
            self.compactify();
        }

        let slot_count = self.slot_count();
        let mut first_free = self.first_free_slot();
        if first_free != slot_count {
            if let SlotKind::Live { offset, size, is_redirect_target } = self.slot_kind(first_free)
            {
                if size >= data_size {
                    self.write_slot(first_free, encode_live(offset, data_size, is_redirect_target));
                    self.set_free_space(self.free_space() - data_size);
                    self.set_first_free_slot(slot_count);
                    return Ok(first_free);
                }
            }
        }

        if first_free == slot_count {
            first_free += 1;
            self.set_first_free_slot(first_free);
        }
        self.set_free_space(self.free_space() - SLOT_SIZE as u32);
        let new_data_start = self.data_start() - data_size;
        self.set_data_start(new_data_start);
        self.set_free_space(self.free_space() - data_size);
        let new_slot_id = slot_count;
        self.set_slot_count(slot_count + 1);
        self.write_slot(new_slot_id, encode_live(new_data_start, data_size, false));
        Ok(new_slot_id)
    }

    /// Grow or shrink an existing live slot's payload.
    pub fn relocate(&mut self, slot_id: u16, data_size: u32) -> Result<()> {
        let slot = self.read_slot(slot_id);
        let (cur_offset, cur_size, is_redirect_target) = match decode_slot(slot) {
            SlotKind::Live { offset, size, is_redirect_target } => (offset, size, is_redirect_target),
            _ => {
                return Err(StorageError::Storage(format!(
                    "relocate on non-live slot {}",
                    slot_id
                )))
            }
        };

        if data_size as u64 > self.free_space() as u64 + cur_size as u64 {
            return Err(StorageError::NoSpaceOnPage(format!(
                "relocate needs {} bytes, have {} free + {} current",
                data_size,
                self.free_space(),
                cur_size
            )));
        }

        if data_size <= cur_size {
            self.set_free_space(self.free_space() + (cur_size - data_size));
            self.write_slot(slot_id, encode_live(cur_offset, data_size, is_redirect_target));
            return Ok(());
        }

        if data_size > self.fragmented_free_space() {
            let copy_len = data_size.min(cur_size) as usize;
            let mut buf = vec![0u8; copy_len];
            buf.copy_from_slice(&self.bytes[cur_offset as usize..cur_offset as usize + copy_len]);

            self.write_slot(slot_id, 0);
            self.compactify();

            let new_offset = self.data_start() - data_size;
            self.set_data_start(new_offset);
            self.set_free_space(self.free_space() + cur_size - data_size);

            self.bytes[new_offset as usize..new_offset as usize + copy_len].copy_from_slice(&buf);
            self.write_slot(slot_id, encode_live(new_offset, data_size, is_redirect_target));
            return Ok(());
        }

        let copy_len = data_size.min(cur_size) as usize;
        let new_offset = self.data_start() - data_size;
        self.bytes
            .copy_within(cur_offset as usize..cur_offset as usize + copy_len, new_offset as usize);
        self.set_data_start(new_offset);
        self.set_free_space(self.free_space() + cur_size - data_size);
        self.write_slot(slot_id, encode_live(new_offset, data_size, is_redirect_target));
        Ok(())
    }

    /// Clear a slot, reclaiming its payload (and, if it was the topmost
    /// allocation, its directory entry and any empty slots preceding it).
    pub fn erase(&mut self, slot_id: u16) {
        let slot = self.read_slot(slot_id);
        let kind = decode_slot(slot);
        let (offset, size) = match kind {
            SlotKind::Live { offset, size, .. } => (offset, size),
            SlotKind::Redirect { .. } => (0, 0),
            SlotKind::Empty => (0, 0),
        };

        let data_start = self.data_start();
        let mut slot_count = self.slot_count();
        let mut free_space = self.free_space();
        let mut first_free = slot_id;

        if offset == data_start && matches!(kind, SlotKind::Live { .. }) {
            slot_count -= 1;
            free_space += size + SLOT_SIZE as u32;
            self.set_data_start(data_start + size);

            let mut i = slot_id as i32 - 1;
            while i >= 0 && matches!(decode_slot(self.read_slot(i as u16)), SlotKind::Empty) {
                free_space += SLOT_SIZE as u32;
                slot_count -= 1;
                i -= 1;
            }
            first_free = (i + 1) as u16;
        } else if !matches!(kind, SlotKind::Redirect { .. }) {
            free_space += size;
        }

        self.write_slot(slot_id, 0);
        self.set_slot_count(slot_count);
        self.set_free_space(free_space);
        self.set_first_free_slot(first_free.min(slot_count));
    }

    /// Rewrite all non-empty, non-redirect slot payloads contiguously at
    /// the top of the page, preserving slot directory order.
    pub fn compactify(&mut self) {
        let slot_count = self.slot_count();
        let snapshot = self.bytes.to_vec();
        let mut data_start = self.bytes.len() as u32;
        for i in 0..slot_count {
            if let SlotKind::Live { offset, size, is_redirect_target } = self.slot_kind(i) {
                data_start -= size;
                self.bytes[data_start as usize..(data_start + size) as usize]
                    .copy_from_slice(&snapshot[offset as usize..(offset + size) as usize]);
                self.write_slot(i, encode_live(data_start, size, is_redirect_target));
            }
        }
        self.set_data_start(data_start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(size: usize) -> Vec<u8> {
        vec![0u8; size]
    }

    #[test]
    fn relocate_grow_past_fragmented_space_does_not_underflow_free_space() {
        // A single live slot growing beyond the fragmented region forces
        // the compactify branch; with no other live slots left afterward,
        // `free_space() - data_size` alone underflows even though
        // `free_space() + cur_size - data_size` does not.
        let mut buf = page(512);
        let mut sp = SlottedPage::init(&mut buf);
        let slot = sp.allocate(100).unwrap();
        sp.relocate(slot, 400).unwrap();
        assert_eq!(sp.free_space(), 512 - HEADER_SIZE as u32 - SLOT_SIZE as u32 - 400);
    }

    #[test]
    fn allocate_write_read_roundtrips() {
        let mut buf = page(256);
        let mut sp = SlottedPage::init(&mut buf);
        let slot = sp.allocate(10).unwrap();
        sp.payload_mut(
            match sp.slot_kind(slot) {
                SlotKind::Live { offset, .. } => offset,
                _ => unreachable!(),
            },
            10,
        )
        .copy_from_slice(b"helloworld");

        let SlotKind::Live { offset, size, .. } = sp.slot_kind(slot) else {
            unreachable!()
        };
        assert_eq!(sp.payload(offset, size), b"helloworld");
    }

    #[test]
    fn free_space_invariant_holds_after_allocate() {
        let mut buf = page(256);
        let mut sp = SlottedPage::init(&mut buf);
        let before = sp.free_space();
        sp.allocate(20).unwrap();
        assert_eq!(sp.free_space(), before - 20 - SLOT_SIZE as u32);
    }

    #[test]
    fn erase_of_last_slot_reclaims_directory_entry() {
        let mut buf = page(256);
        let mut sp = SlottedPage::init(&mut buf);
        let before = sp.free_space();
        let slot = sp.allocate(20).unwrap();
        sp.erase(slot);
        assert_eq!(sp.free_space(), before);
        assert_eq!(sp.slot_count(), 0);
    }

    #[test]
    fn allocate_succeeds_after_compaction_of_tombstoned_page() {
        let mut buf = page(128);
        let mut sp = SlottedPage::init(&mut buf);
        let mut slots = Vec::new();
        while let Ok(s) = sp.allocate(8) {
            slots.push(s);
        }
        assert!(slots.len() > 1);
        // erase every slot but the last one, fragmenting the page
        for &s in &slots[..slots.len() - 1] {
            sp.erase(s);
        }
        let big = sp.allocate(40);
        assert!(big.is_ok(), "allocate should succeed via compaction");
    }

    #[test]
    fn relocate_grow_moves_payload_and_preserves_bytes() {
        let mut buf = page(512);
        let mut sp = SlottedPage::init(&mut buf);
        let slot = sp.allocate(10).unwrap();
        let SlotKind::Live { offset, .. } = sp.slot_kind(slot) else {
            unreachable!()
        };
        sp.payload_mut(offset, 10).copy_from_slice(b"0123456789");

        sp.relocate(slot, 400).unwrap();
        let SlotKind::Live { offset, size, .. } = sp.slot_kind(slot) else {
            unreachable!()
        };
        assert_eq!(size, 400);
        assert_eq!(&sp.payload(offset, size)[..10], b"0123456789");
    }

    #[test]
    fn relocate_shrink_is_in_place() {
        let mut buf = page(256);
        let mut sp = SlottedPage::init(&mut buf);
        let slot = sp.allocate(100).unwrap();
        let SlotKind::Live { offset: before_offset, .. } = sp.slot_kind(slot) else {
            unreachable!()
        };
        sp.relocate(slot, 40).unwrap();
        let SlotKind::Live { offset, size, .. } = sp.slot_kind(slot) else {
            unreachable!()
        };
        assert_eq!(offset, before_offset);
        assert_eq!(size, 40);
    }
}
