pub mod btree;
pub mod storage;

pub use btree::BPlusTree;
pub use storage::{BUFFER_POOL_SIZE, BufferManager, DiskManager, PAGE_SIZE};
