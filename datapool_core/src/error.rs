//! Error types for the data pool
//!
//! Construction, publish and attach failures are returned to the caller
//! synchronously. The subscriber loop and the health check log and recover
//! from the same errors instead of propagating them.

use std::io;
use thiserror::Error;

/// Result alias used throughout the data pool
pub type DataPoolResult<T> = Result<T, DataPoolError>;

/// Errors raised by the data pool
#[derive(Debug, Error)]
pub enum DataPoolError {
    /// Attach requested without a name or descriptor
    #[error("getting data from shared memory requires a non-empty name or descriptor")]
    DataNameEmpty,

    /// A different block with this name is already in the local catalog
    #[error("a block named '{0}' is already registered")]
    DuplicateName(String),

    /// Array payload type is not in the supported numeric set
    #[error("array format not supported: {0}")]
    FormatNotSupported(String),

    /// Sequence element is outside the supported primitive kinds
    #[error("unsupported sequence element: {0}")]
    UnsupportedDataFormat(String),

    /// No block with this name in the local catalog
    #[error("block '{0}' does not exist")]
    BlockNotFound(String),

    /// Index outside the block bounds
    #[error("index {index} out of range for {bound}")]
    IndexOutOfRange { index: String, bound: String },

    /// The backing shared segment no longer exists
    #[error("shared segment '{0}' is gone")]
    SegmentGone(String),

    /// Block name cannot be used as a segment name or in a descriptor
    #[error("invalid block name '{0}'")]
    InvalidName(String),

    /// Malformed registry descriptor
    #[error("cannot decode descriptor '{descriptor}': {reason}")]
    Decode { descriptor: String, reason: String },

    /// Encoded descriptor does not fit in a registry slot
    #[error("descriptor of {len} bytes exceeds the registry slot width of {width} bytes")]
    SlotOverflow { len: usize, width: usize },

    /// Data length or segment size disagrees with the declared shape
    #[error("shape mismatch for '{name}': {reason}")]
    ShapeMismatch { name: String, reason: String },

    /// Typed access with an element type different from the block's
    #[error("element type mismatch: block holds {found}, requested {expected}")]
    DTypeMismatch {
        expected: &'static str,
        found: String,
    },

    /// Array operation on a sequence block or the other way round
    #[error("block '{name}' is a {found} block")]
    KindMismatch { name: String, found: &'static str },

    /// Sequence item larger than the storage allocated for it at creation
    #[error("item {index} needs {needed} bytes but only {available} are allocated")]
    CapacityExceeded {
        index: usize,
        needed: usize,
        available: usize,
    },

    /// Segment contents do not follow the expected layout
    #[error("shared segment '{name}' is corrupt: {reason}")]
    CorruptSegment { name: String, reason: String },

    /// Access through a handle that was already closed
    #[error("block '{0}' has been closed")]
    BlockClosed(String),

    /// The cross-process registry lock could not be taken or released
    #[error("registry lock failed: {0}")]
    RegistryLock(#[source] io::Error),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DataPoolError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        DataPoolError::Config(msg.into())
    }

    /// Create a descriptor decode error
    pub fn decode<S: Into<String>>(descriptor: &str, reason: S) -> Self {
        DataPoolError::Decode {
            descriptor: descriptor.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an out-of-range error for a flat index
    pub fn out_of_range(index: usize, len: usize) -> Self {
        DataPoolError::IndexOutOfRange {
            index: index.to_string(),
            bound: format!("0 <= index < {}", len),
        }
    }

    /// True when the error means the backing segment has vanished
    pub fn is_segment_gone(&self) -> bool {
        match self {
            DataPoolError::SegmentGone(_) => true,
            DataPoolError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = DataPoolError::out_of_range(5, 3);
        assert_eq!(err.to_string(), "index 5 out of range for 0 <= index < 3");

        let err = DataPoolError::SlotOverflow { len: 120, width: 100 };
        assert!(err.to_string().contains("120"));
    }

    #[test]
    fn test_segment_gone_classification() {
        assert!(DataPoolError::SegmentGone("m".into()).is_segment_gone());
        let not_found = DataPoolError::from(io::Error::from(io::ErrorKind::NotFound));
        assert!(not_found.is_segment_gone());
        assert!(!DataPoolError::DataNameEmpty.is_segment_gone());
    }
}
