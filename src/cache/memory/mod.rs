//! Buffer ownership and recycling
//!
//! Serialized payloads travel through pooled buffers; the chunk type records
//! who is responsible for recycling each one.

pub mod buffer;
pub mod pool;

pub use buffer::BufferChunk;
pub use pool::{BufferPool, PoolStats};
