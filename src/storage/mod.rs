mod buffer_manager;
mod disk_manager;
mod error;

pub use buffer_manager::BufferManager;
pub use disk_manager::DiskManager;
pub use error::{StorageError, StorageResult};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Number of frames in the buffer pool (64 * 4KB = 256KiB of cache)
pub const BUFFER_POOL_SIZE: usize = 64;

/// Page ID type; ids are handed out sequentially starting from 0
pub type PageId = i32;

/// Sentinel page id meaning "no page"
pub const INVALID_PAGE_ID: PageId = -1;
