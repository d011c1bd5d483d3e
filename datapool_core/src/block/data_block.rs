use super::descriptor::{array_byte_len, BlockDescriptor, BlockLayout};
use super::dtype::{DType, Element};
use super::sequence::{SharedSequence, Value};
use crate::error::{DataPoolError, DataPoolResult};
use crate::memory::platform::validate_name;
use crate::memory::shm_region::SharedSegment;
use ndarray::{ArrayBase, ArrayD, ArrayViewD, ArrayViewMutD, Data, Dimension, IxDyn};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Backing storage of a block
#[derive(Debug)]
enum Storage {
    Array(SharedSegment),
    Sequence(SharedSequence),
}

impl Storage {
    fn segment(&self) -> &SharedSegment {
        match self {
            Storage::Array(segment) => segment,
            Storage::Sequence(sequence) => sequence.segment(),
        }
    }
}

/// Owned snapshot of an array block, tagged by element type
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Int8(ArrayD<i8>),
    Int16(ArrayD<i16>),
    Int32(ArrayD<i32>),
    Int64(ArrayD<i64>),
    UInt8(ArrayD<u8>),
    UInt16(ArrayD<u16>),
    UInt32(ArrayD<u32>),
    UInt64(ArrayD<u64>),
    Float32(ArrayD<f32>),
    Float64(ArrayD<f64>),
}

impl ArrayData {
    pub fn dtype(&self) -> DType {
        match self {
            ArrayData::Int8(_) => DType::Int8,
            ArrayData::Int16(_) => DType::Int16,
            ArrayData::Int32(_) => DType::Int32,
            ArrayData::Int64(_) => DType::Int64,
            ArrayData::UInt8(_) => DType::UInt8,
            ArrayData::UInt16(_) => DType::UInt16,
            ArrayData::UInt32(_) => DType::UInt32,
            ArrayData::UInt64(_) => DType::UInt64,
            ArrayData::Float32(_) => DType::Float32,
            ArrayData::Float64(_) => DType::Float64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            ArrayData::Int8(a) => a.shape(),
            ArrayData::Int16(a) => a.shape(),
            ArrayData::Int32(a) => a.shape(),
            ArrayData::Int64(a) => a.shape(),
            ArrayData::UInt8(a) => a.shape(),
            ArrayData::UInt16(a) => a.shape(),
            ArrayData::UInt32(a) => a.shape(),
            ArrayData::UInt64(a) => a.shape(),
            ArrayData::Float32(a) => a.shape(),
            ArrayData::Float64(a) => a.shape(),
        }
    }
}

/// Whole-block snapshot returned by [`DataBlock::data`]
#[derive(Debug, Clone, PartialEq)]
pub enum BlockData {
    Array(ArrayData),
    List(Vec<Value>),
    Tuple(Vec<Value>),
}

/// A named block of shared data plus its metadata
///
/// Built either from local data (the owner path: `create_*`) or from a
/// registry descriptor (the attacher path: [`attach`](Self::attach)).
/// Closing is idempotent and also happens when the last handle is dropped;
/// only the owner unlinks the backing segment.
///
/// Block contents carry no cross-process locking. Concurrent writers in
/// different processes must coordinate on their own.
#[derive(Debug)]
pub struct DataBlock {
    descriptor: BlockDescriptor,
    local_pid: u32,
    storage: RwLock<Option<Storage>>,
    available: AtomicBool,
}

impl DataBlock {
    fn new(descriptor: BlockDescriptor, local_pid: u32, storage: Storage) -> Self {
        Self {
            descriptor,
            local_pid,
            storage: RwLock::new(Some(storage)),
            available: AtomicBool::new(true),
        }
    }

    /// Create an array block from local data, copying it into a new segment
    pub fn create_array<T, S, D>(
        base_dir: &Path,
        name: &str,
        data: &ArrayBase<S, D>,
        local_pid: u32,
        copy_on_read: bool,
    ) -> DataPoolResult<Self>
    where
        T: Element,
        S: Data<Elem = T>,
        D: Dimension,
    {
        let contiguous = data.as_standard_layout();
        let values = contiguous.as_slice().ok_or_else(|| DataPoolError::ShapeMismatch {
            name: name.to_string(),
            reason: "array is not contiguous".to_string(),
        })?;
        Self::create_array_from_bytes(
            base_dir,
            name,
            bytemuck::cast_slice(values),
            data.shape(),
            T::DTYPE.tag(),
            local_pid,
            copy_on_read,
        )
    }

    /// Create an array block from raw row-major bytes and a dtype tag
    ///
    /// Fails with [`DataPoolError::FormatNotSupported`] for an unknown tag.
    pub fn create_array_from_bytes(
        base_dir: &Path,
        name: &str,
        bytes: &[u8],
        shape: &[usize],
        dtype_tag: &str,
        local_pid: u32,
        copy_on_read: bool,
    ) -> DataPoolResult<Self> {
        validate_name(name)?;
        let dtype = dtype_tag.parse::<DType>()?;
        if shape.is_empty() || shape.contains(&0) {
            return Err(DataPoolError::ShapeMismatch {
                name: name.to_string(),
                reason: format!("shape {:?} must be non-empty positive dimensions", shape),
            });
        }
        let expected = array_byte_len(shape, dtype).ok_or_else(|| DataPoolError::ShapeMismatch {
            name: name.to_string(),
            reason: format!("shape {:?} of {} is too large", shape, dtype),
        })?;
        if bytes.len() != expected {
            return Err(DataPoolError::ShapeMismatch {
                name: name.to_string(),
                reason: format!(
                    "{} bytes given, shape {:?} of {} needs {}",
                    bytes.len(),
                    shape,
                    dtype,
                    expected
                ),
            });
        }

        let segment = SharedSegment::create(base_dir, name, bytes.len())?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), segment.as_mut_ptr(), bytes.len()) };

        let layout = BlockLayout::Array {
            dtype,
            shape: shape.to_vec(),
        };
        let descriptor = BlockDescriptor::new(name, layout, local_pid, copy_on_read);
        log::debug!("Created array block {}", descriptor);
        Ok(Self::new(descriptor, local_pid, Storage::Array(segment)))
    }

    /// Create a sequence block of fixed length from local items
    ///
    /// Tuples always read by copy, whatever `copy_on_read` says.
    pub fn create_sequence(
        base_dir: &Path,
        name: &str,
        items: &[Value],
        is_tuple: bool,
        local_pid: u32,
        copy_on_read: bool,
    ) -> DataPoolResult<Self> {
        validate_name(name)?;
        let sequence = SharedSequence::create(base_dir, name, items)?;
        let layout = BlockLayout::Sequence {
            length: items.len(),
            is_tuple,
        };
        let descriptor = BlockDescriptor::new(name, layout, local_pid, copy_on_read);
        log::debug!("Created sequence block {}", descriptor);
        Ok(Self::new(descriptor, local_pid, Storage::Sequence(sequence)))
    }

    /// Attach to an existing block from its registry descriptor
    ///
    /// The owner pid comes from the descriptor, so closing this handle in a
    /// process other than the creator only detaches.
    pub fn attach(base_dir: &Path, encoded: &str, local_pid: u32) -> DataPoolResult<Self> {
        let descriptor = BlockDescriptor::decode(encoded)?;
        Self::from_descriptor(base_dir, descriptor, local_pid)
    }

    /// Attach to an existing block from an already decoded descriptor
    pub fn from_descriptor(
        base_dir: &Path,
        descriptor: BlockDescriptor,
        local_pid: u32,
    ) -> DataPoolResult<Self> {
        let storage = match &descriptor.layout {
            BlockLayout::Sequence { length, .. } => {
                Storage::Sequence(SharedSequence::open(base_dir, &descriptor.name, *length)?)
            }
            BlockLayout::Array { dtype, shape } => {
                let needed = array_byte_len(shape, *dtype).ok_or_else(|| DataPoolError::ShapeMismatch {
                    name: descriptor.name.clone(),
                    reason: format!("shape {:?} of {} is too large", shape, dtype),
                })?;
                let segment = SharedSegment::open(base_dir, &descriptor.name)?;
                if segment.size() < needed {
                    return Err(DataPoolError::ShapeMismatch {
                        name: descriptor.name.clone(),
                        reason: format!(
                            "segment has {} bytes, shape {:?} of {} needs {}",
                            segment.size(),
                            shape,
                            dtype,
                            needed
                        ),
                    });
                }
                Storage::Array(segment)
            }
        };
        log::debug!("Attached block {}", descriptor);
        Ok(Self::new(descriptor, local_pid, storage))
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Type tag: numeric dtype name, `list` or `tuple`
    pub fn element_type(&self) -> &'static str {
        self.descriptor.layout.element_type()
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.descriptor.layout
    }

    pub fn descriptor(&self) -> &BlockDescriptor {
        &self.descriptor
    }

    /// Registry slot text for this block
    pub fn encode(&self) -> String {
        self.descriptor.encode()
    }

    pub fn owner_pid(&self) -> u32 {
        self.descriptor.owner_pid
    }

    /// True when the process holding this handle created the segment
    pub fn is_owner(&self) -> bool {
        self.descriptor.owner_pid == self.local_pid
    }

    pub fn copy_on_read(&self) -> bool {
        self.descriptor.copy_on_read
    }

    /// False once the block has been closed
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Number of elements (array) or items (sequence)
    pub fn len(&self) -> usize {
        self.descriptor.layout.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn closed(&self) -> DataPoolError {
        DataPoolError::BlockClosed(self.descriptor.name.clone())
    }

    fn kind_mismatch(&self) -> DataPoolError {
        DataPoolError::KindMismatch {
            name: self.descriptor.name.clone(),
            found: self.descriptor.layout.kind_name(),
        }
    }

    fn array_shape<T: Element>(&self) -> DataPoolResult<&[usize]> {
        match &self.descriptor.layout {
            BlockLayout::Array { dtype, shape } if *dtype == T::DTYPE => Ok(shape),
            BlockLayout::Array { dtype, .. } => Err(DataPoolError::DTypeMismatch {
                expected: T::DTYPE.tag(),
                found: dtype.tag().to_string(),
            }),
            BlockLayout::Sequence { .. } => Err(self.kind_mismatch()),
        }
    }

    fn out_of_bounds(&self, index: &[usize], shape: &[usize]) -> DataPoolError {
        DataPoolError::IndexOutOfRange {
            index: format!("{:?}", index),
            bound: format!("shape {:?}", shape),
        }
    }

    /// Run `f` over the array contents
    ///
    /// With `copy_on_read` the view is over a private snapshot; otherwise it
    /// is a live view of the shared segment, so slicing it (`s![..]`) reads
    /// shared memory directly.
    pub fn with_array<T: Element, R>(&self, f: impl FnOnce(ArrayViewD<'_, T>) -> R) -> DataPoolResult<R> {
        if self.copy_on_read() {
            let snapshot = self.to_array::<T>()?;
            return Ok(f(snapshot.view()));
        }

        self.with_array_live(f)
    }

    /// Run `f` with a mutable live view of the shared array
    ///
    /// Writes land in shared memory regardless of `copy_on_read`.
    pub fn with_array_mut<T: Element, R>(
        &self,
        f: impl FnOnce(ArrayViewMutD<'_, T>) -> R,
    ) -> DataPoolResult<R> {
        let shape = self.array_shape::<T>()?;
        let guard = self.storage.write();
        let storage = guard.as_ref().ok_or_else(|| self.closed())?;
        let ptr = storage.segment().as_mut_ptr() as *mut T;
        let view = unsafe { ArrayViewMutD::from_shape_ptr(IxDyn(shape), ptr) };
        Ok(f(view))
    }

    /// Deep copy of the array contents
    pub fn to_array<T: Element>(&self) -> DataPoolResult<ArrayD<T>> {
        self.with_array_live(|view: ArrayViewD<'_, T>| view.to_owned())
    }

    /// Read one array element by multi-index
    pub fn get<T: Element>(&self, index: &[usize]) -> DataPoolResult<T> {
        let shape = self.array_shape::<T>()?;
        let value = self.with_array_live::<T, _>(|view| view.get(index).copied())?;
        value.ok_or_else(|| self.out_of_bounds(index, shape))
    }

    /// Write one array element by multi-index
    pub fn set<T: Element>(&self, index: &[usize], value: T) -> DataPoolResult<()> {
        let shape = self.array_shape::<T>()?;
        let written = self.with_array_mut::<T, _>(|mut view| match view.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        })?;
        if written {
            Ok(())
        } else {
            Err(self.out_of_bounds(index, shape))
        }
    }

    // live view over shared memory, whatever copy_on_read says
    fn with_array_live<T: Element, R>(&self, f: impl FnOnce(ArrayViewD<'_, T>) -> R) -> DataPoolResult<R> {
        let shape = self.array_shape::<T>()?;
        let guard = self.storage.read();
        let storage = guard.as_ref().ok_or_else(|| self.closed())?;
        let ptr = storage.segment().as_ptr() as *const T;
        // the segment is page aligned and at least shape * size_of::<T>() bytes
        let view = unsafe { ArrayViewD::from_shape_ptr(IxDyn(shape), ptr) };
        Ok(f(view))
    }

    fn with_sequence<R>(&self, f: impl FnOnce(&SharedSequence) -> DataPoolResult<R>) -> DataPoolResult<R> {
        let guard = self.storage.read();
        match guard.as_ref() {
            Some(Storage::Sequence(sequence)) => f(sequence),
            Some(Storage::Array(_)) => Err(self.kind_mismatch()),
            None => Err(self.closed()),
        }
    }

    /// Read one sequence item, bounds-checked against the fixed length
    pub fn get_item(&self, index: usize) -> DataPoolResult<Value> {
        self.with_sequence(|sequence| sequence.get(index))
    }

    /// Overwrite one sequence item
    pub fn set_item<V: Into<Value>>(&self, index: usize, value: V) -> DataPoolResult<()> {
        let value = value.into();
        // exclusive in-process so two local writers never interleave bytes
        let guard = self.storage.write();
        match guard.as_ref() {
            Some(Storage::Sequence(sequence)) => sequence.set(index, &value),
            Some(Storage::Array(_)) => Err(self.kind_mismatch()),
            None => Err(self.closed()),
        }
    }

    /// Overwrite one sequence item from a dynamically typed value
    ///
    /// Fails with [`DataPoolError::UnsupportedDataFormat`] for nested lists,
    /// objects and integers outside the signed 64-bit range.
    pub fn set_item_json(&self, index: usize, value: serde_json::Value) -> DataPoolResult<()> {
        self.set_item(index, Value::try_from(value)?)
    }

    /// Materialize all sequence items locally
    pub fn to_vec(&self) -> DataPoolResult<Vec<Value>> {
        self.with_sequence(|sequence| sequence.to_vec())
    }

    /// Snapshot of the whole block
    pub fn data(&self) -> DataPoolResult<BlockData> {
        match &self.descriptor.layout {
            BlockLayout::Sequence { is_tuple: true, .. } => Ok(BlockData::Tuple(self.to_vec()?)),
            BlockLayout::Sequence { is_tuple: false, .. } => Ok(BlockData::List(self.to_vec()?)),
            BlockLayout::Array { dtype, .. } => {
                let array = match dtype {
                    DType::Int8 => ArrayData::Int8(self.to_array()?),
                    DType::Int16 => ArrayData::Int16(self.to_array()?),
                    DType::Int32 => ArrayData::Int32(self.to_array()?),
                    DType::Int64 => ArrayData::Int64(self.to_array()?),
                    DType::UInt8 => ArrayData::UInt8(self.to_array()?),
                    DType::UInt16 => ArrayData::UInt16(self.to_array()?),
                    DType::UInt32 => ArrayData::UInt32(self.to_array()?),
                    DType::UInt64 => ArrayData::UInt64(self.to_array()?),
                    DType::Float32 => ArrayData::Float32(self.to_array()?),
                    DType::Float64 => ArrayData::Float64(self.to_array()?),
                };
                Ok(BlockData::Array(array))
            }
        }
    }

    /// True while the segment found by name is the one this handle maps
    ///
    /// A segment unlinked and created again under the same name counts as
    /// gone. Once closed, only the name is checked.
    pub fn segment_exists(&self, base_dir: &Path) -> DataPoolResult<bool> {
        match self.storage.read().as_ref() {
            Some(storage) => storage.segment().is_linked(),
            None => SharedSegment::exists(base_dir, &self.descriptor.name),
        }
    }

    // open and still linked under its name; lookup errors count as stale
    pub(crate) fn maps_linked_segment(&self) -> bool {
        match self.storage.read().as_ref() {
            Some(storage) => storage.segment().is_linked().unwrap_or(false),
            None => false,
        }
    }

    /// Release the block
    ///
    /// The owner unlinks the segment system-wide; attachers only drop their
    /// mapping. Closing an already closed block does nothing.
    pub fn close(&self) -> DataPoolResult<()> {
        if !self.available.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let storage = self.storage.write().take();
        let Some(storage) = storage else {
            return Ok(());
        };

        if self.is_owner() {
            storage.segment().unlink()?;
            log::debug!("Released block '{}' (owner, unlinked)", self.descriptor.name);
        } else {
            log::debug!(
                "Detached block '{}' (owned by pid {})",
                self.descriptor.name,
                self.descriptor.owner_pid
            );
        }
        Ok(())
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        if self.is_available() {
            if let Err(e) = self.close() {
                log::error!("Failed to close block '{}': {}", self.descriptor.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, s, Array2};
    use tempfile::tempdir;

    const OWNER: u32 = 100;
    const OTHER: u32 = 200;

    #[test]
    fn test_array_round_trip_through_descriptor() {
        let dir = tempdir().unwrap();
        let data = array![[1.5f64, 2.0, 3.0], [4.0, 5.0, 6.25]];
        let block = DataBlock::create_array(dir.path(), "mat", &data, OWNER, false).unwrap();
        assert_eq!(block.encode(), format!("mat;2,3;float64;{};0", OWNER));

        let attached = DataBlock::attach(dir.path(), &block.encode(), OTHER).unwrap();
        assert_eq!(attached.to_array::<f64>().unwrap(), data.into_dyn());
        assert!(!attached.is_owner());
        assert_eq!(attached.owner_pid(), OWNER);
    }

    #[test]
    fn test_shared_view_semantics() {
        let dir = tempdir().unwrap();
        let zeros = Array2::<i32>::zeros((2, 2));
        let owner = DataBlock::create_array(dir.path(), "m", &zeros, OWNER, false).unwrap();
        let attached = DataBlock::attach(dir.path(), &owner.encode(), OTHER).unwrap();

        attached.set::<i32>(&[0, 0], 1).unwrap();
        assert_eq!(owner.get::<i32>(&[0, 0]).unwrap(), 1);

        let row_sum = owner
            .with_array::<i32, _>(|view| view.slice(s![0, ..]).sum())
            .unwrap();
        assert_eq!(row_sum, 1);
    }

    #[test]
    fn test_copy_on_read_array_is_detached() {
        let dir = tempdir().unwrap();
        let zeros = Array2::<u8>::zeros((2, 2));
        let block = DataBlock::create_array(dir.path(), "c", &zeros, OWNER, true).unwrap();

        let mut snapshot = block.to_array::<u8>().unwrap();
        snapshot[[1, 1]] = 9;
        assert_eq!(block.get::<u8>(&[1, 1]).unwrap(), 0);

        block.set::<u8>(&[1, 1], 3).unwrap();
        let seen = block.with_array::<u8, _>(|view| view[[1, 1]]).unwrap();
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_array_index_and_type_errors() {
        let dir = tempdir().unwrap();
        let block =
            DataBlock::create_array(dir.path(), "e", &Array2::<i64>::zeros((2, 3)), OWNER, false).unwrap();

        assert!(matches!(
            block.get::<i64>(&[2, 0]),
            Err(DataPoolError::IndexOutOfRange { .. })
        ));
        assert!(matches!(
            block.set::<i64>(&[0], 1),
            Err(DataPoolError::IndexOutOfRange { .. })
        ));
        assert!(matches!(
            block.get::<f32>(&[0, 0]),
            Err(DataPoolError::DTypeMismatch { .. })
        ));
        assert!(matches!(block.get_item(0), Err(DataPoolError::KindMismatch { .. })));
    }

    #[test]
    fn test_unknown_dtype_rejected() {
        let dir = tempdir().unwrap();
        let err = DataBlock::create_array_from_bytes(dir.path(), "x", &[0; 16], &[2], "complex64", OWNER, false)
            .unwrap_err();
        assert!(matches!(err, DataPoolError::FormatNotSupported(_)));

        let err = DataBlock::create_array_from_bytes(dir.path(), "x", &[0; 3], &[2], "int16", OWNER, false)
            .unwrap_err();
        assert!(matches!(err, DataPoolError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_oversized_shape_rejected() {
        let dir = tempdir().unwrap();
        let err = DataBlock::create_array_from_bytes(dir.path(), "x", &[0; 8], &[1 << 62, 8], "uint8", OWNER, false)
            .unwrap_err();
        assert!(matches!(err, DataPoolError::ShapeMismatch { .. }));

        let _small = DataBlock::create_array_from_bytes(dir.path(), "x", &[0; 8], &[1], "int64", OWNER, false)
            .unwrap();
        let huge = BlockDescriptor::new(
            "x",
            BlockLayout::Array {
                dtype: DType::Int64,
                shape: vec![1 << 32, 1 << 32],
            },
            OWNER,
            false,
        );
        assert!(matches!(
            DataBlock::from_descriptor(dir.path(), huge, OTHER),
            Err(DataPoolError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_recreated_segment_is_not_the_mapped_one() {
        let dir = tempdir().unwrap();
        let zeros = Array2::<i32>::zeros((2, 2));
        let first = DataBlock::create_array(dir.path(), "r", &zeros, OWNER, false).unwrap();
        let attached = DataBlock::attach(dir.path(), &first.encode(), OTHER).unwrap();
        assert!(attached.segment_exists(dir.path()).unwrap());

        first.close().unwrap();
        let second = DataBlock::create_array(dir.path(), "r", &zeros, OWNER, false).unwrap();
        assert!(second.segment_exists(dir.path()).unwrap());
        assert!(!attached.segment_exists(dir.path()).unwrap());
    }

    #[test]
    fn test_sequence_read_write() {
        let dir = tempdir().unwrap();
        let items = vec![Value::Int(1), Value::from("two"), Value::None];
        let block = DataBlock::create_sequence(dir.path(), "l", &items, false, OWNER, false).unwrap();
        assert_eq!(block.element_type(), "list");
        assert!(!block.copy_on_read());

        block.set_item(2, 3.5).unwrap();
        assert_eq!(block.get_item(2).unwrap(), Value::Float(3.5));
        assert!(matches!(
            block.get_item(3),
            Err(DataPoolError::IndexOutOfRange { .. })
        ));
        assert!(matches!(
            block.set_item_json(0, serde_json::json!([1])),
            Err(DataPoolError::UnsupportedDataFormat(_))
        ));
        assert!(matches!(
            block.data().unwrap(),
            BlockData::List(values) if values.len() == 3
        ));
    }

    #[test]
    fn test_tuple_forces_copy_on_read() {
        let dir = tempdir().unwrap();
        let block =
            DataBlock::create_sequence(dir.path(), "t", &[Value::Bool(true)], true, OWNER, false).unwrap();
        assert!(block.copy_on_read());
        assert_eq!(block.encode(), format!("t;1;tuple;{};1", OWNER));
        assert_eq!(block.data().unwrap(), BlockData::Tuple(vec![Value::Bool(true)]));
    }

    #[test]
    fn test_owner_close_unlinks_attacher_close_detaches() {
        let dir = tempdir().unwrap();
        let owner =
            DataBlock::create_array(dir.path(), "o", &Array2::<f32>::zeros((1, 1)), OWNER, false).unwrap();
        let attached = DataBlock::attach(dir.path(), &owner.encode(), OTHER).unwrap();

        attached.close().unwrap();
        assert!(!attached.is_available());
        assert!(owner.segment_exists(dir.path()).unwrap());
        assert!(DataBlock::attach(dir.path(), &owner.encode(), OTHER).is_ok());

        owner.close().unwrap();
        owner.close().unwrap();
        assert!(!owner.segment_exists(dir.path()).unwrap());
        assert!(matches!(
            DataBlock::attach(dir.path(), &owner.encode(), OTHER),
            Err(DataPoolError::SegmentGone(_))
        ));
        assert!(matches!(
            owner.get::<f32>(&[0, 0]),
            Err(DataPoolError::BlockClosed(_))
        ));
    }

    #[test]
    fn test_drop_releases_owned_segment() {
        let dir = tempdir().unwrap();
        {
            let _block =
                DataBlock::create_sequence(dir.path(), "d", &[Value::Int(0)], false, OWNER, false).unwrap();
            assert!(SharedSegment::exists(dir.path(), "d").unwrap());
        }
        assert!(!SharedSegment::exists(dir.path(), "d").unwrap());
    }
}
