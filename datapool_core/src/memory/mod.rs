//! # Shared memory primitives for the data pool
//!
//! - **SharedSegment**: a named, file-backed memory mapping in the host's
//!   shared-memory directory, with an owner/attacher lifetime model
//! - **platform**: base directory resolution and name-to-file mapping
//!
//! Segments are plain byte regions. Layout (array payload, sequence table,
//! registry ring) is decided by the modules built on top.

pub mod platform;
pub mod shm_region;

pub use platform::{has_native_shm, shm_base_dir};
pub use shm_region::SharedSegment;
