//! # Data Pool Core
//!
//! Cross-process shared data pool. Processes on one host publish named blocks
//! of data into shared memory and discover each other's blocks through a
//! broadcast registry, so large arrays and small lists can be exchanged
//! without copying them through a socket.
//!
//! - **Memory**: named shared segments backed by the host's shared-memory directory
//! - **Registry**: fixed ring of descriptor slots behind an OS-shared lock
//! - **Blocks**: numeric arrays (`ndarray` views) and fixed-length sequences
//! - **Subscriber**: background discovery of blocks published elsewhere
//! - **Pool**: the per-process context tying catalog, registry and lifecycle together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use datapool_core::{DataPool, PoolConfig};
//! use ndarray::Array2;
//!
//! # fn main() -> datapool_core::DataPoolResult<()> {
//! let pool = DataPool::open(PoolConfig::default())?;
//! let block = pool.create_array("m", &Array2::<i32>::zeros((2, 2)), false)?;
//! pool.publish(&block)?;
//!
//! // In another process, after its subscriber has polled:
//! // let m = pool.get_block("m")?;
//! // m.set::<i32>(&[0, 0], 1)?;
//!
//! println!("m[0,0] = {}", block.get::<i32>(&[0, 0])?);
//! pool.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod catalog;
pub mod config;
pub mod error;
pub mod memory;
pub mod pool;
pub mod registry;
pub mod subscriber;

// Re-export commonly used types for easy access
pub use block::{ArrayData, BlockData, BlockDescriptor, BlockLayout, DType, DataBlock, Element, Value};
pub use catalog::LocalCatalog;
pub use config::PoolConfig;
pub use error::{DataPoolError, DataPoolResult};
pub use pool::DataPool;
pub use registry::{AtomicCursor, SharedRegistry};
pub use subscriber::{Poll, SubscriberHandle, SubscriberLoop, SubscriberState};
