//! LatticeDB page file and buffer pool.
//!
//! This crate maps logical page numbers to fixed-size resident buffers,
//! bounds the resident set, tracks dirty pages, and writes them back to
//! the backing index file.

pub mod file;
pub mod frame;
pub mod pool;
pub mod replacer;

pub use file::PageFile;
pub use frame::{Frame, FrameId};
pub use pool::{BufferPool, BufferPoolConfig, BufferPoolStats};
pub use replacer::{LruReplacer, Replacer};
