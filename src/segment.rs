//! Segment base: every on-disk structure (B+tree, SP-segment, FSI) is a
//! view over a contiguous run of pages within one segment id, addressed
//! through a shared [`BufferManager`].

use std::sync::Arc;

use crate::buffer_manager::BufferManager;
use crate::page_id::{make_page_id, PageId, SegmentId};

/// Ties a segment id to the shared buffer pool and hands out page ids
/// scoped to that segment.
#[derive(Clone)]
pub struct Segment {
    id: SegmentId,
    buffer_manager: Arc<BufferManager>,
}

impl Segment {
    pub fn new(id: SegmentId, buffer_manager: Arc<BufferManager>) -> Self {
        Self { id, buffer_manager }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.buffer_manager
    }

    /// The page id for a page local to this segment.
    pub fn page_id(&self, local_index: u64) -> PageId {
        make_page_id(self.id, local_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_id_is_scoped_to_segment() {
        let bm = Arc::new(BufferManager::new(64, 4));
        let seg = Segment::new(3, bm);
        let pid = seg.page_id(10);
        assert_eq!(crate::page_id::segment_id(pid), 3);
        assert_eq!(crate::page_id::local_index(pid), 10);
    }
}
