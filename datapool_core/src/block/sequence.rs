//! Fixed-length shared sequences
//!
//! Segment layout:
//!
//! ```text
//! [header 32 B][entry table: length x 24 B][item storage]
//! header: magic u32 | version u32 | length u64 | data offset u64 | reserved u64
//! entry:  tag u8 | pad 3 | len u32 | offset u64 | capacity u64
//! ```
//!
//! Each item gets storage sized when the sequence is created (its encoded
//! length rounded up to 8 bytes, at least 8). The element count never
//! changes and a later write must fit in the item's storage.

use crate::error::{DataPoolError, DataPoolResult};
use crate::memory::shm_region::SharedSegment;
use std::fmt;
use std::path::Path;

/// Largest text or byte-string item (10 MiB)
pub const MAX_ITEM_BYTES: usize = 10 * 1024 * 1024;

const SEQUENCE_MAGIC: u32 = 0x4450_5351; // "DPSQ"
const SEQUENCE_VERSION: u32 = 1;
const HEADER_SIZE: usize = 32;
const ENTRY_SIZE: usize = 24;
const MIN_ITEM_CAPACITY: usize = 8;

const TAG_NONE: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_BOOL: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_BYTES: u8 = 5;

/// One primitive item of a sequence block
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
    None,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Text(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::None => "none",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Value::None => TAG_NONE,
            Value::Int(_) => TAG_INT,
            Value::Float(_) => TAG_FLOAT,
            Value::Bool(_) => TAG_BOOL,
            Value::Text(_) => TAG_TEXT,
            Value::Bytes(_) => TAG_BYTES,
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            Value::None => Vec::new(),
            Value::Int(v) => v.to_le_bytes().to_vec(),
            Value::Float(v) => v.to_le_bytes().to_vec(),
            Value::Bool(v) => vec![*v as u8],
            Value::Text(s) => s.as_bytes().to_vec(),
            Value::Bytes(b) => b.clone(),
        }
    }

    /// Check the item is storable: strings and byte strings are capped at 10 MiB
    pub fn validate(&self) -> DataPoolResult<()> {
        let len = match self {
            Value::Text(s) => s.len(),
            Value::Bytes(b) => b.len(),
            _ => 0,
        };
        if len > MAX_ITEM_BYTES {
            return Err(DataPoolError::UnsupportedDataFormat(format!(
                "{} item of {} bytes exceeds the {} byte limit",
                self.type_name(),
                len,
                MAX_ITEM_BYTES
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "b[{} bytes]", b.len()),
            Value::None => f.write_str("None"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::None)
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = DataPoolError;

    fn try_from(value: serde_json::Value) -> DataPoolResult<Self> {
        use serde_json::Value as Json;
        let item = match value {
            Json::Null => Value::None,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if n.is_u64() {
                    return Err(DataPoolError::UnsupportedDataFormat(format!(
                        "integer {} does not fit in a signed 64-bit item",
                        n
                    )));
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::Text(s),
            Json::Array(_) => {
                return Err(DataPoolError::UnsupportedDataFormat(
                    "nested list".to_string(),
                ))
            }
            Json::Object(_) => {
                return Err(DataPoolError::UnsupportedDataFormat("object".to_string()))
            }
        };
        item.validate()?;
        Ok(item)
    }
}

fn item_capacity(encoded_len: usize) -> usize {
    encoded_len.max(MIN_ITEM_CAPACITY).div_ceil(8) * 8
}

/// A fixed-length sequence stored in a shared segment
#[derive(Debug)]
pub struct SharedSequence {
    segment: SharedSegment,
    length: usize,
}

impl SharedSequence {
    /// Allocate a new segment holding `items`
    pub fn create(base_dir: &Path, name: &str, items: &[Value]) -> DataPoolResult<Self> {
        for item in items {
            item.validate()?;
        }
        let encoded: Vec<Vec<u8>> = items.iter().map(Value::encode).collect();

        let data_offset = HEADER_SIZE + items.len() * ENTRY_SIZE;
        let data_size: usize = encoded.iter().map(|e| item_capacity(e.len())).sum();
        let segment = SharedSegment::create(base_dir, name, data_offset + data_size)?;

        let sequence = Self {
            segment,
            length: items.len(),
        };
        sequence.write_u32(0, SEQUENCE_MAGIC);
        sequence.write_u32(4, SEQUENCE_VERSION);
        sequence.write_u64(8, items.len() as u64);
        sequence.write_u64(16, data_offset as u64);

        let mut offset = data_offset;
        for (index, (item, bytes)) in items.iter().zip(&encoded).enumerate() {
            let capacity = item_capacity(bytes.len());
            let entry = HEADER_SIZE + index * ENTRY_SIZE;
            sequence.write_u64(entry + 8, offset as u64);
            sequence.write_u64(entry + 16, capacity as u64);
            sequence.write_bytes(offset, bytes);
            sequence.write_u32(entry + 4, bytes.len() as u32);
            sequence.write_bytes(entry, &[item.tag()]);
            offset += capacity;
        }

        Ok(sequence)
    }

    /// Bind to an existing sequence segment, checking it holds `expected_len` items
    pub fn open(base_dir: &Path, name: &str, expected_len: usize) -> DataPoolResult<Self> {
        let segment = SharedSegment::open(base_dir, name)?;
        if segment.size() < HEADER_SIZE {
            return Err(corrupt(name, "segment smaller than the sequence header"));
        }

        let mut sequence = Self { segment, length: 0 };
        if sequence.read_u32(0) != SEQUENCE_MAGIC || sequence.read_u32(4) != SEQUENCE_VERSION {
            return Err(corrupt(name, "not a shared sequence"));
        }
        let length = sequence.read_u64(8) as usize;
        if length != expected_len {
            return Err(DataPoolError::ShapeMismatch {
                name: name.to_string(),
                reason: format!("descriptor says {} items, segment holds {}", expected_len, length),
            });
        }
        let table_end = length
            .checked_mul(ENTRY_SIZE)
            .and_then(|t| t.checked_add(HEADER_SIZE))
            .filter(|end| *end <= sequence.segment.size())
            .ok_or_else(|| corrupt(name, "entry table exceeds segment"))?;
        if (sequence.read_u64(16) as usize) < table_end {
            return Err(corrupt(name, "item storage overlaps the entry table"));
        }
        sequence.length = length;
        Ok(sequence)
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    /// Read one item
    pub fn get(&self, index: usize) -> DataPoolResult<Value> {
        let (tag, len, offset, capacity) = self.entry(index)?;
        if len > capacity {
            return Err(corrupt(self.segment.name(), format!("item {} overruns its storage", index)));
        }
        let bytes = self.read_bytes(offset, len);
        let name = self.segment.name();
        let value = match tag {
            TAG_NONE => Value::None,
            TAG_INT => Value::Int(i64::from_le_bytes(fixed8(&bytes, name, index)?)),
            TAG_FLOAT => Value::Float(f64::from_le_bytes(fixed8(&bytes, name, index)?)),
            TAG_BOOL => Value::Bool(bytes.first().copied().unwrap_or(0) != 0),
            TAG_TEXT => Value::Text(
                String::from_utf8(bytes)
                    .map_err(|_| corrupt(name, format!("item {} is not valid UTF-8", index)))?,
            ),
            TAG_BYTES => Value::Bytes(bytes),
            other => return Err(corrupt(name, format!("item {} has unknown tag {}", index, other))),
        };
        Ok(value)
    }

    /// Overwrite one item in place
    pub fn set(&self, index: usize, value: &Value) -> DataPoolResult<()> {
        value.validate()?;
        let (_, _, offset, capacity) = self.entry(index)?;
        let bytes = value.encode();
        if bytes.len() > capacity {
            return Err(DataPoolError::CapacityExceeded {
                index,
                needed: bytes.len(),
                available: capacity,
            });
        }

        let entry = HEADER_SIZE + index * ENTRY_SIZE;
        self.write_bytes(offset, &bytes);
        self.write_u32(entry + 4, bytes.len() as u32);
        self.write_bytes(entry, &[value.tag()]);
        Ok(())
    }

    /// Materialize every item into a local vector
    pub fn to_vec(&self) -> DataPoolResult<Vec<Value>> {
        (0..self.length).map(|i| self.get(i)).collect()
    }

    fn entry(&self, index: usize) -> DataPoolResult<(u8, usize, usize, usize)> {
        if index >= self.length {
            return Err(DataPoolError::out_of_range(index, self.length));
        }
        let entry = HEADER_SIZE + index * ENTRY_SIZE;
        let tag = self.read_bytes(entry, 1)[0];
        let len = self.read_u32(entry + 4) as usize;
        let offset = self.read_u64(entry + 8) as usize;
        let capacity = self.read_u64(entry + 16) as usize;
        match offset.checked_add(capacity) {
            Some(end) if end <= self.segment.size() => Ok((tag, len, offset, capacity)),
            _ => Err(corrupt(
                self.segment.name(),
                format!("item {} points outside the segment", index),
            )),
        }
    }

    fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        debug_assert!(offset + len <= self.segment.size());
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.segment.as_ptr().add(offset), out.as_mut_ptr(), len)
        };
        out
    }

    fn write_bytes(&self, offset: usize, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() <= self.segment.size());
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.segment.as_mut_ptr().add(offset),
                bytes.len(),
            )
        };
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.read_bytes(offset, 4));
        u32::from_le_bytes(buf)
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.read_bytes(offset, 8));
        u64::from_le_bytes(buf)
    }

    fn write_u32(&self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    fn write_u64(&self, offset: usize, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }
}

fn fixed8(bytes: &[u8], name: &str, index: usize) -> DataPoolResult<[u8; 8]> {
    bytes
        .try_into()
        .map_err(|_| corrupt(name, format!("item {} has {} bytes, expected 8", index, bytes.len())))
}

fn corrupt<S: Into<String>>(name: &str, reason: S) -> DataPoolError {
    DataPoolError::CorruptSegment {
        name: name.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Vec<Value> {
        vec![
            Value::Int(-7),
            Value::Float(2.5),
            Value::Bool(true),
            Value::from("howdy"),
            Value::Bytes(vec![1, 2, 3]),
            Value::None,
        ]
    }

    #[test]
    fn test_items_survive_attach() {
        let dir = tempdir().unwrap();
        let owner = SharedSequence::create(dir.path(), "seq", &sample()).unwrap();
        let attached = SharedSequence::open(dir.path(), "seq", 6).unwrap();
        assert_eq!(attached.to_vec().unwrap(), sample());
        assert_eq!(owner.len(), 6);
    }

    #[test]
    fn test_write_is_visible_to_attacher() {
        let dir = tempdir().unwrap();
        let owner = SharedSequence::create(dir.path(), "seq", &sample()).unwrap();
        let attached = SharedSequence::open(dir.path(), "seq", 6).unwrap();

        attached.set(0, &Value::Float(-1.0)).unwrap();
        attached.set(5, &Value::from("tiny")).unwrap();
        assert_eq!(owner.get(0).unwrap(), Value::Float(-1.0));
        assert_eq!(owner.get(5).unwrap(), Value::Text("tiny".into()));
    }

    #[test]
    fn test_item_storage_is_fixed() {
        let dir = tempdir().unwrap();
        let seq = SharedSequence::create(dir.path(), "seq", &[Value::from("abc")]).unwrap();

        // "abc" was given 8 bytes
        seq.set(0, &Value::from("12345678")).unwrap();
        let err = seq.set(0, &Value::from("123456789")).unwrap_err();
        assert!(matches!(
            err,
            DataPoolError::CapacityExceeded {
                index: 0,
                needed: 9,
                available: 8
            }
        ));
    }

    #[test]
    fn test_bounds_checked() {
        let dir = tempdir().unwrap();
        let seq = SharedSequence::create(dir.path(), "seq", &sample()).unwrap();
        assert!(matches!(seq.get(6), Err(DataPoolError::IndexOutOfRange { .. })));
        assert!(matches!(
            seq.set(100, &Value::None),
            Err(DataPoolError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_length_mismatch_on_open() {
        let dir = tempdir().unwrap();
        let _seq = SharedSequence::create(dir.path(), "seq", &sample()).unwrap();
        assert!(matches!(
            SharedSequence::open(dir.path(), "seq", 3),
            Err(DataPoolError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_json_conversion() {
        let ok = Value::try_from(serde_json::json!("x")).unwrap();
        assert_eq!(ok, Value::Text("x".into()));
        assert_eq!(Value::try_from(serde_json::json!(3)).unwrap(), Value::Int(3));
        assert_eq!(Value::try_from(serde_json::json!(null)).unwrap(), Value::None);

        for bad in [
            serde_json::json!([1, 2]),
            serde_json::json!({"a": 1}),
            serde_json::json!(u64::MAX),
        ] {
            assert!(matches!(
                Value::try_from(bad),
                Err(DataPoolError::UnsupportedDataFormat(_))
            ));
        }
    }

    #[test]
    fn test_oversized_text_rejected() {
        let big = Value::Bytes(vec![0; MAX_ITEM_BYTES + 1]);
        assert!(matches!(
            big.validate(),
            Err(DataPoolError::UnsupportedDataFormat(_))
        ));
    }
}
