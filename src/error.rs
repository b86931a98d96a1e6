use thiserror::Error;

/// Crate-wide error type. Each storage subsystem surfaces through one of these
/// variants rather than panicking; contract violations (wrong `Register` type
/// in a comparison, out-of-range slot id) are asserted instead, per spec.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No evictable frame was found while fixing a page.
    #[error("buffer is full")]
    BufferFull,

    /// A slotted page (or the segment built on top of it) has no room for a
    /// requested allocation or resize.
    #[error("no space on page: {0}")]
    NoSpaceOnPage(String),

    /// Any other storage-layer contract violation that is worth a message
    /// instead of an assertion (corrupt on-disk layout, bad page id, ...).
    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
