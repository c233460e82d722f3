//! Fixed-capacity buffer pool for large archive allocations.

pub mod buffer_pool;

pub use buffer_pool::{BufferPool, PooledBuffer};
