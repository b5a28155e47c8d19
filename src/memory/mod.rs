//! Host memory primitives.
//!
//! - [`SharedMemorySegment`]: an owned read/write mapping of a shared memory object
//! - [`ShmProducer`]: creates and unlinks a named POSIX object (the producer role)
//! - [`SlotBitmap`]: fixed-capacity slot tracking for the region pool

mod bitmap;
mod producer;
mod shared;

pub use bitmap::SlotBitmap;
pub use producer::ShmProducer;
pub use shared::{SharedMemorySegment, object_path};
