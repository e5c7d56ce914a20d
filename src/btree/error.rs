use thiserror::Error;

use crate::storage::{PageId, StorageError};

/// Result type for tree operations
pub type TreeResult<T> = Result<T, TreeError>;

/// Errors that can occur during B+ tree operations
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Corrupted node: page {page_id} has page type {raw}")]
    CorruptNode { page_id: PageId, raw: i32 },
}
