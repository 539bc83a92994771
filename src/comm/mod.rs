//! Distributed exchange interface for dispatched expert buffers.
//!
//! The engine only consumes the all-to-all primitive; implementations live
//! behind the [`ProcessGroup`] trait with an explicit group handle:
//! - SharedMemory: in-process mesh for tests and single-node runs
//! - multi-node backends plug in externally

mod shared_memory;
mod traits;

pub use shared_memory::{run_group, SharedMemoryComm, SharedMemoryGroup};
pub use traits::{CommError, CommResult, ProcessGroup, TensorMessage};
