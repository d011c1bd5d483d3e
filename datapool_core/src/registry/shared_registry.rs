use super::cursor::AtomicCursor;
use crate::config::PoolConfig;
use crate::error::{DataPoolError, DataPoolResult};
use crate::memory::shm_region::SharedSegment;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;

const REGISTRY_MAGIC: u32 = 0x4450_5247; // "DPRG"
const REGISTRY_VERSION: u32 = 1;

/// Header at the start of the registry segment
#[repr(C, align(64))]
struct RegistryHeader {
    magic: u32,
    version: u32,
    capacity: u32,
    slot_width: u32,
    sequence: AtomicU64,
    pending: AtomicU64,
    _reserved: [u8; 32],
}

/// Length prefix stored in front of every slot's text
const SLOT_LEN_PREFIX: usize = mem::size_of::<u32>();

/// Fixed-capacity ring of fixed-width text slots in shared memory
///
/// Every publish overwrites the next slot in ring order, so this is a bounded
/// broadcast log: a subscriber that falls more than `capacity` publishes
/// behind loses the overwritten entries.
pub struct SharedRegistry {
    segment: SharedSegment,
    cursor: AtomicCursor,
    capacity: usize,
    slot_width: usize,
    slot_stride: usize,
}

impl SharedRegistry {
    /// Open the registry named in `config`, creating it if this is the first process
    pub fn open(config: &PoolConfig) -> DataPoolResult<Self> {
        config.validate()?;
        let capacity = config.capacity;
        let slot_width = config.slot_width;
        let slot_stride = Self::stride(slot_width);
        let header_size = mem::size_of::<RegistryHeader>();
        let total_size = capacity
            .checked_mul(slot_stride)
            .and_then(|data| data.checked_add(header_size))
            .ok_or_else(|| DataPoolError::config("registry size overflows"))?;

        let segment = SharedSegment::create_or_open(
            &config.base_dir(),
            &config.registry_name,
            total_size,
            |bytes| {
                let header = bytes.as_mut_ptr() as *mut RegistryHeader;
                unsafe {
                    header.write(RegistryHeader {
                        magic: REGISTRY_MAGIC,
                        version: REGISTRY_VERSION,
                        capacity: capacity as u32,
                        slot_width: slot_width as u32,
                        sequence: AtomicU64::new(0),
                        pending: AtomicU64::new(0),
                        _reserved: [0; 32],
                    });
                }
                Ok(())
            },
        )?;

        if segment.size() < total_size {
            return Err(DataPoolError::CorruptSegment {
                name: config.registry_name.clone(),
                reason: format!("registry is {} bytes, expected {}", segment.size(), total_size),
            });
        }

        let header_ptr = segment.as_mut_ptr() as *mut RegistryHeader;
        let header = unsafe { &*header_ptr };
        if header.magic != REGISTRY_MAGIC || header.version != REGISTRY_VERSION {
            return Err(DataPoolError::CorruptSegment {
                name: config.registry_name.clone(),
                reason: "bad registry header".to_string(),
            });
        }
        if header.capacity as usize != capacity || header.slot_width as usize != slot_width {
            return Err(DataPoolError::config(format!(
                "registry '{}' has {} slots of {} bytes, configured {} slots of {} bytes",
                config.registry_name, header.capacity, header.slot_width, capacity, slot_width
            )));
        }

        let (sequence, pending) = unsafe {
            (
                NonNull::new_unchecked(std::ptr::addr_of_mut!((*header_ptr).sequence)),
                NonNull::new_unchecked(std::ptr::addr_of_mut!((*header_ptr).pending)),
            )
        };
        let cursor = unsafe { AtomicCursor::from_raw(sequence, pending, capacity) };

        log::debug!(
            "Registry '{}' ready: {} slots x {} bytes, sequence {}",
            config.registry_name,
            capacity,
            slot_width,
            cursor.sequence()
        );

        Ok(Self {
            segment,
            cursor,
            capacity,
            slot_width,
            slot_stride,
        })
    }

    fn stride(slot_width: usize) -> usize {
        (SLOT_LEN_PREFIX + slot_width).div_ceil(8) * 8
    }

    fn slot_ptr(&self, slot: usize) -> *mut u8 {
        debug_assert!(slot < self.capacity);
        unsafe {
            self.segment
                .as_mut_ptr()
                .add(mem::size_of::<RegistryHeader>() + slot * self.slot_stride)
        }
    }

    /// Write `encoded` into the next slot and advance the cursor
    ///
    /// Returns the slot index written. Descriptors wider than a slot are
    /// rejected before the lock is taken.
    pub fn publish(&self, encoded: &str) -> DataPoolResult<usize> {
        let bytes = encoded.as_bytes();
        if bytes.len() > self.slot_width {
            return Err(DataPoolError::SlotOverflow {
                len: bytes.len(),
                width: self.slot_width,
            });
        }

        let mut guard = self.cursor.lock(self.segment.file())?;
        let (seq, slot) = guard.next();
        guard.claim(seq);
        unsafe {
            let ptr = self.slot_ptr(slot);
            std::ptr::copy_nonoverlapping(
                (bytes.len() as u32).to_le_bytes().as_ptr(),
                ptr,
                SLOT_LEN_PREFIX,
            );
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(SLOT_LEN_PREFIX), bytes.len());
        }
        guard.commit(seq);
        drop(guard);

        log::debug!("[{}]Put shared message: {}", slot, encoded);
        Ok(slot)
    }

    /// Read the raw text of a slot; `None` if it was never written
    pub fn read_slot(&self, slot: usize) -> DataPoolResult<Option<String>> {
        if slot >= self.capacity {
            return Err(DataPoolError::out_of_range(slot, self.capacity));
        }

        let ptr = self.slot_ptr(slot);
        let mut len_bytes = [0u8; SLOT_LEN_PREFIX];
        unsafe { std::ptr::copy_nonoverlapping(ptr, len_bytes.as_mut_ptr(), SLOT_LEN_PREFIX) };
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > self.slot_width {
            return Err(DataPoolError::CorruptSegment {
                name: self.segment.name().to_string(),
                reason: format!("slot {} claims {} bytes", slot, len),
            });
        }

        let mut text = vec![0u8; len];
        unsafe { std::ptr::copy_nonoverlapping(ptr.add(SLOT_LEN_PREFIX), text.as_mut_ptr(), len) };
        String::from_utf8(text).map(Some).map_err(|_| DataPoolError::CorruptSegment {
            name: self.segment.name().to_string(),
            reason: format!("slot {} is not valid UTF-8", slot),
        })
    }

    /// Read the entry published as sequence number `seq`
    ///
    /// Returns `None` when the entry has already been overwritten, including
    /// when a publisher lapped it while it was being copied.
    pub fn read_entry(&self, seq: u64) -> DataPoolResult<Option<String>> {
        let current = self.cursor.sequence();
        if seq == 0 || seq > current || current - seq >= self.capacity as u64 {
            return Ok(None);
        }
        let text = self.read_slot(self.cursor.slot_of(seq));
        // a publisher that claimed seq + capacity or later may have torn the copy
        if self.cursor.pending() - seq >= self.capacity as u64 {
            return Ok(None);
        }
        text
    }

    pub fn cursor(&self) -> &AtomicCursor {
        &self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_width(&self) -> usize {
        self.slot_width
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// True if this handle created the registry
    pub fn is_owner(&self) -> bool {
        self.segment.is_owner()
    }

    /// Remove the registry from the system (owner only by convention)
    pub fn unlink(&self) -> DataPoolResult<()> {
        self.segment.unlink()
    }
}
