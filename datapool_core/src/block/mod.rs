//! # Data blocks
//!
//! A block is a named unit of shared data plus the metadata another process
//! needs to find it:
//!
//! - **Array** blocks hold a rectangular numeric buffer (see [`DType`]) and
//!   are read through `ndarray` views
//! - **Sequence** blocks hold a fixed number of primitive items ([`Value`]),
//!   either as a list or as a tuple (tuples always read by copy)
//!
//! The descriptor codec in [`descriptor`] is the registry wire format.

pub mod data_block;
pub mod descriptor;
pub mod dtype;
pub mod sequence;

pub use data_block::{ArrayData, BlockData, DataBlock};
pub use descriptor::{BlockDescriptor, BlockLayout};
pub use dtype::{DType, Element};
pub use sequence::{SharedSequence, Value, MAX_ITEM_BYTES};
