//! Free-space inventory: one nibble per data page, packed two-per-byte
//! across FSI pages. Ported from
//! `examples/original_source/slotted-pages/src/fsi_segment.cc`.
//!
//! Each FSI page covers `2 * page_size` data pages (`page_size` bytes, two
//! nibbles per byte). `target_page` is resolved to `(fsi_local_index,
//! nibble_index)` the same way the original does it, via `target %
//! (2 * page_size)` / `target / (2 * page_size)`.

use crate::buffer_manager::BufferManager;
use crate::error::Result;
use crate::segment::Segment;
use crate::slotted_page::SLOT_SIZE;

pub struct FsiSegment {
    segment: Segment,
}

fn encode_free_space(free_space: u32, page_size: u32) -> u8 {
    (free_space / (page_size / 16)) as u8
}

fn decode_free_space(nibble: u8, page_size: u32) -> u32 {
    nibble as u32 * (page_size / 16)
}

impl FsiSegment {
    pub fn new(segment: Segment) -> Self {
        Self { segment }
    }

    fn buffer_manager(&self) -> &BufferManager {
        self.segment.buffer_manager()
    }

    /// Record `target_page`'s current free space.
    pub fn update(&self, target_page: u64, free_space: u32) -> Result<()> {
        let page_size = self.buffer_manager().page_size() as u32;
        let span = 2 * page_size as u64;
        let fsi_page = target_page / span;
        let nibble_index = (target_page % span) as u32;
        let byte_index = (nibble_index / 2) as usize;

        let mut page = self.buffer_manager().fix_page(self.segment.page_id(fsi_page), true)?;
        let bytes = page.data_mut();
        let current = bytes[byte_index];
        let new_nibble = encode_free_space(free_space, page_size) & 0x0F;
        bytes[byte_index] = if nibble_index.is_multiple_of(2) {
            (new_nibble << 4) | (current & 0x0F)
        } else {
            (current & 0xF0) | new_nibble
        };
        self.buffer_manager().unfix_page(page, true);
        Ok(())
    }

    /// First data page (below `allocated_pages`) whose decoded free-space
    /// bucket strictly exceeds `required + sizeof(slot)`.
    pub fn find(&self, required_space: u32, allocated_pages: u64) -> Result<Option<u64>> {
        let page_size = self.buffer_manager().page_size() as u32;
        let span = 2u64 * page_size as u64;
        let threshold = required_space + SLOT_SIZE as u32;

        let mut fsi_page = 0u64;
        while fsi_page * span < allocated_pages {
            let page = self.buffer_manager().fix_page(self.segment.page_id(fsi_page), false)?;
            let bytes = page.data();
            let mut found = None;
            for nibble_index in 0..span {
                let target = fsi_page * span + nibble_index;
                if target >= allocated_pages {
                    break;
                }
                let byte = bytes[(nibble_index / 2) as usize];
                let nibble = if nibble_index.is_multiple_of(2) { byte >> 4 } else { byte & 0x0F };
                let free = decode_free_space(nibble, page_size);
                if free > threshold {
                    found = Some(target);
                    break;
                }
            }
            self.buffer_manager().unfix_page(page, false);
            if found.is_some() {
                return Ok(found);
            }
            fsi_page += 1;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fsi(page_size: usize) -> FsiSegment {
        let bm = Arc::new(BufferManager::new(page_size, 8));
        FsiSegment::new(Segment::new(0, bm))
    }

    #[test]
    fn update_then_find_locates_the_right_page() {
        let fsi = fsi(64);
        fsi.update(3, 60).unwrap();
        let found = fsi.find(10, 10).unwrap();
        assert_eq!(found, Some(3));
    }

    #[test]
    fn find_skips_pages_below_threshold() {
        let fsi = fsi(64);
        fsi.update(0, 4).unwrap();
        fsi.update(1, 60).unwrap();
        let found = fsi.find(20, 10).unwrap();
        assert_eq!(found, Some(1));
    }

    #[test]
    fn update_preserves_neighbouring_nibble() {
        let fsi = fsi(64);
        fsi.update(0, 60).unwrap();
        fsi.update(1, 4).unwrap();
        // page 0's nibble (upper) must still reflect 60, unclobbered by
        // updating page 1's (lower) nibble in the same byte.
        assert_eq!(fsi.find(50, 10).unwrap(), Some(0));
    }
}
