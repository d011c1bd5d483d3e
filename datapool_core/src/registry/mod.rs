//! # Broadcast registry
//!
//! A fixed number of text slots in one shared segment plus a process-shared
//! cursor. Publishing a block writes its descriptor to the next slot; every
//! subscriber polls the cursor to discover new blocks.
//!
//! Publishes are totally ordered by an OS-level lock (`flock` on the registry
//! file). If a process dies while holding it the kernel releases the lock, but
//! the slot it was writing may hold a torn descriptor; subscribers skip such
//! entries when they fail to decode.

pub mod cursor;
pub mod shared_registry;

pub use cursor::AtomicCursor;
pub use shared_registry::SharedRegistry;
