use std::io;
use thiserror::Error;

use super::PageId;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors from the disk manager and buffer pool
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid page id: {0}")]
    InvalidPageId(PageId),

    #[error("Page not resident in buffer pool: page_id={0}")]
    PageNotResident(PageId),

    #[error("Buffer pool exhausted: all {0} frames are pinned")]
    PoolExhausted(usize),
}
