//! Process-shared publish cursor
//!
//! The cursor is a 64-bit publish sequence living in the registry header,
//! next to a `pending` word naming the entry currently being written.
//! Writers advance both only while holding the in-process mutex and an
//! exclusive `flock` on the registry file; readers poll them lock-free.

use crate::error::{DataPoolError, DataPoolResult};
use crate::memory::shm_region::FileLockGuard;
use parking_lot::{Mutex, MutexGuard};
use std::fs::File;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Shared counter identifying the most recently written registry slot
pub struct AtomicCursor {
    sequence: NonNull<AtomicU64>,
    pending: NonNull<AtomicU64>,
    capacity: usize,
    // flock does not exclude threads sharing one descriptor
    local: Mutex<()>,
}

unsafe impl Send for AtomicCursor {}
unsafe impl Sync for AtomicCursor {}

impl AtomicCursor {
    /// Bind a cursor to the sequence word of a mapped registry header
    ///
    /// # Safety
    ///
    /// Both words must point into a live shared mapping, be 8-byte aligned
    /// and outlive the cursor.
    pub(crate) unsafe fn from_raw(
        sequence: NonNull<AtomicU64>,
        pending: NonNull<AtomicU64>,
        capacity: usize,
    ) -> Self {
        Self {
            sequence,
            pending,
            capacity,
            local: Mutex::new(()),
        }
    }

    /// Total number of publishes since the registry was created
    pub fn sequence(&self) -> u64 {
        unsafe { self.sequence.as_ref() }.load(Ordering::Acquire)
    }

    /// Highest sequence number a publisher has started writing
    ///
    /// Read after copying a slot: if it has moved past the copied entry's
    /// retention window, the copy may be torn.
    pub fn pending(&self) -> u64 {
        fence(Ordering::Acquire);
        unsafe { self.pending.as_ref() }.load(Ordering::Relaxed)
    }

    /// Index of the most recently written slot, or -1 before the first publish
    pub fn slot(&self) -> i64 {
        match self.sequence() {
            0 => -1,
            seq => self.slot_of(seq) as i64,
        }
    }

    /// Slot holding the entry published as sequence number `seq` (1-based)
    pub fn slot_of(&self, seq: u64) -> usize {
        ((seq - 1) % self.capacity as u64) as usize
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquire the cross-process publish lock
    ///
    /// Blocks until every other publisher, in this or any other process, has
    /// released it.
    pub fn lock<'a>(&'a self, file: &'a File) -> DataPoolResult<CursorGuard<'a>> {
        let local = self.local.lock();
        let file_lock = FileLockGuard::lock(file).map_err(DataPoolError::RegistryLock)?;
        Ok(CursorGuard {
            cursor: self,
            _file_lock: file_lock,
            _local: local,
        })
    }
}

/// Exclusive right to advance the cursor
pub struct CursorGuard<'a> {
    cursor: &'a AtomicCursor,
    // released before the in-process mutex
    _file_lock: FileLockGuard<'a>,
    _local: MutexGuard<'a, ()>,
}

impl CursorGuard<'_> {
    /// Sequence number and slot the next publish will use
    pub fn next(&self) -> (u64, usize) {
        let seq = self.cursor.sequence() + 1;
        (seq, self.cursor.slot_of(seq))
    }

    /// Announce that the slot for `seq` is about to be overwritten
    pub fn claim(&mut self, seq: u64) {
        unsafe { self.cursor.pending.as_ref() }.store(seq, Ordering::Relaxed);
        fence(Ordering::Release);
    }

    /// Make the entry at `seq` visible to subscribers
    pub fn commit(&mut self, seq: u64) {
        unsafe { self.cursor.sequence.as_ref() }.store(seq, Ordering::Release);
    }
}
