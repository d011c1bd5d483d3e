//! Registry slot wire format
//!
//! `name;shape_or_length;element_type;owner_pid;copy_on_read`
//!
//! - `shape_or_length`: comma-joined positive integers for arrays, a bare
//!   integer for sequences
//! - `element_type`: numeric dtype tag, or `list` / `tuple`
//! - `copy_on_read`: `1` or `0`
//!
//! Example: `/expmatrix;1,3,3;int32;4242;1` or `/explist;14;list;4243;0`

use super::dtype::DType;
use crate::error::{DataPoolError, DataPoolResult};
use crate::memory::platform::validate_name;
use std::fmt;
use std::str::FromStr;

const FIELD_COUNT: usize = 5;

/// Shape and element type of a block, decoded once from the type tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockLayout {
    /// Rectangular numeric buffer
    Array { dtype: DType, shape: Vec<usize> },
    /// Fixed-length sequence of primitive scalars
    Sequence { length: usize, is_tuple: bool },
}

impl BlockLayout {
    /// Type tag written to descriptors
    pub fn element_type(&self) -> &'static str {
        match self {
            BlockLayout::Array { dtype, .. } => dtype.tag(),
            BlockLayout::Sequence { is_tuple: false, .. } => "list",
            BlockLayout::Sequence { is_tuple: true, .. } => "tuple",
        }
    }

    /// `array` or `sequence`, for error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            BlockLayout::Array { .. } => "array",
            BlockLayout::Sequence { .. } => "sequence",
        }
    }

    /// Number of elements in the block
    pub fn len(&self) -> usize {
        match self {
            BlockLayout::Array { shape, .. } => shape.iter().fold(1usize, |acc, dim| acc.saturating_mul(*dim)),
            BlockLayout::Sequence { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Byte size of a `shape` array of `dtype`, or None if it cannot be addressed
pub fn array_byte_len(shape: &[usize], dtype: DType) -> Option<usize> {
    let bytes = shape
        .iter()
        .try_fold(dtype.size(), |acc, dim| acc.checked_mul(*dim))?;
    (bytes <= isize::MAX as usize).then_some(bytes)
}

/// Everything another process needs to attach to a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub name: String,
    pub layout: BlockLayout,
    pub owner_pid: u32,
    pub copy_on_read: bool,
}

impl BlockDescriptor {
    /// Build a descriptor, forcing copy-on-read for tuples
    pub fn new(name: &str, layout: BlockLayout, owner_pid: u32, copy_on_read: bool) -> Self {
        let copy_on_read = copy_on_read || matches!(layout, BlockLayout::Sequence { is_tuple: true, .. });
        Self {
            name: name.to_string(),
            layout,
            owner_pid,
            copy_on_read,
        }
    }

    /// Render the slot text
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Parse slot text
    pub fn decode(encoded: &str) -> DataPoolResult<Self> {
        if encoded.is_empty() {
            return Err(DataPoolError::DataNameEmpty);
        }

        let fields: Vec<&str> = encoded.split(';').collect();
        if fields.len() != FIELD_COUNT {
            return Err(DataPoolError::decode(
                encoded,
                format!("expected {} fields, found {}", FIELD_COUNT, fields.len()),
            ));
        }
        let (name, shape_or_length, element_type, owner_pid, copy_on_read) =
            (fields[0], fields[1], fields[2], fields[3], fields[4]);

        validate_name(name)?;

        let layout = match element_type {
            "list" | "tuple" => {
                let length = shape_or_length.parse::<usize>().map_err(|_| {
                    DataPoolError::decode(encoded, format!("bad sequence length '{}'", shape_or_length))
                })?;
                BlockLayout::Sequence {
                    length,
                    is_tuple: element_type == "tuple",
                }
            }
            tag => {
                let dtype = tag.parse::<DType>()?;
                let shape = parse_shape(shape_or_length)
                    .ok_or_else(|| DataPoolError::decode(encoded, format!("bad shape '{}'", shape_or_length)))?;
                if array_byte_len(&shape, dtype).is_none() {
                    return Err(DataPoolError::decode(
                        encoded,
                        format!("shape '{}' of {} is too large", shape_or_length, dtype),
                    ));
                }
                BlockLayout::Array { dtype, shape }
            }
        };

        let owner_pid = owner_pid
            .parse::<u32>()
            .map_err(|_| DataPoolError::decode(encoded, format!("bad owner pid '{}'", owner_pid)))?;

        let copy_on_read = match copy_on_read {
            "1" => true,
            "0" => false,
            other => {
                return Err(DataPoolError::decode(
                    encoded,
                    format!("copy_on_read must be 1 or 0, found '{}'", other),
                ))
            }
        };

        Ok(Self::new(name, layout, owner_pid, copy_on_read))
    }
}

fn parse_shape(text: &str) -> Option<Vec<usize>> {
    let shape = text
        .split(',')
        .map(|dim| dim.parse::<usize>().ok().filter(|d| *d > 0))
        .collect::<Option<Vec<_>>>()?;
    (!shape.is_empty()).then_some(shape)
}

impl fmt::Display for BlockDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};", self.name)?;
        match &self.layout {
            BlockLayout::Array { shape, .. } => {
                let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
                write!(f, "{}", dims.join(","))?;
            }
            BlockLayout::Sequence { length, .. } => write!(f, "{}", length)?,
        }
        write!(
            f,
            ";{};{};{}",
            self.layout.element_type(),
            self.owner_pid,
            if self.copy_on_read { "1" } else { "0" }
        )
    }
}

impl FromStr for BlockDescriptor {
    type Err = DataPoolError;

    fn from_str(s: &str) -> DataPoolResult<Self> {
        Self::decode(s)
    }
}
