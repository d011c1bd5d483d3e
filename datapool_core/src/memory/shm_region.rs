// Data pool shared memory segment - file-backed mappings under /dev/shm/datapool
use super::platform::segment_path;
use crate::error::{DataPoolError, DataPoolResult};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Exclusive `flock(2)` held on a file until dropped
///
/// The lock belongs to the open file description, so it excludes other
/// processes and other descriptors of the same file in this process. The
/// kernel drops it when the holder dies.
pub(crate) struct FileLockGuard<'a> {
    file: &'a File,
}

impl<'a> FileLockGuard<'a> {
    /// Block until the exclusive lock is held
    pub(crate) fn lock(file: &'a File) -> io::Result<Self> {
        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(Self { file });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            log::error!(
                "Failed to release file lock: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// One OS shared memory allocation, the unit of raw storage
///
/// Exactly one process creates a segment (its owner); every other handle is
/// an attacher. Only the owner is expected to [`unlink`](Self::unlink) it.
#[derive(Debug)]
pub struct SharedSegment {
    mmap: MmapMut,
    ptr: NonNull<u8>,
    size: usize,
    path: PathBuf,
    file: File,
    name: String,
    owner: bool,
}

// Thread safety: the mapping lives as long as the segment and every access
// goes through explicit pointer reads and writes.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create a new segment of `size` bytes, zero-filled
    ///
    /// Fails with [`DataPoolError::DuplicateName`] if a segment with this name
    /// already exists on the host.
    pub fn create(base_dir: &Path, name: &str, size: usize) -> DataPoolResult<Self> {
        if size == 0 {
            return Err(DataPoolError::ShapeMismatch {
                name: name.to_string(),
                reason: "cannot create a zero-sized segment".to_string(),
            });
        }
        std::fs::create_dir_all(base_dir)?;
        let path = segment_path(base_dir, name);

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(DataPoolError::DuplicateName(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = file.set_len(size as u64) {
            let _ = std::fs::remove_file(&path);
            return Err(e.into());
        }

        let segment = match Self::map(file, path.clone(), name, size, true) {
            Ok(segment) => segment,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
        };

        log::debug!(
            "Created shared segment '{}' ({} bytes) at {}",
            name,
            size,
            path.display()
        );
        Ok(segment)
    }

    /// Open an existing segment (no creation)
    pub fn open(base_dir: &Path, name: &str) -> DataPoolResult<Self> {
        let path = segment_path(base_dir, name);

        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DataPoolError::SegmentGone(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(DataPoolError::CorruptSegment {
                name: name.to_string(),
                reason: "segment has zero length".to_string(),
            });
        }

        let segment = Self::map(file, path, name, size, false)?;
        log::debug!("Opened shared segment '{}' ({} bytes)", name, size);
        Ok(segment)
    }

    /// Open the segment, creating it if nobody has yet
    ///
    /// Creation and `init` run under an exclusive file lock, so a concurrent
    /// opener never observes a half-initialised segment. The returned handle
    /// is the owner only if this call created the segment.
    pub fn create_or_open<F>(base_dir: &Path, name: &str, size: usize, init: F) -> DataPoolResult<Self>
    where
        F: FnOnce(&mut [u8]) -> DataPoolResult<()>,
    {
        std::fs::create_dir_all(base_dir)?;
        let path = segment_path(base_dir, name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut segment = {
            let _guard = FileLockGuard::lock(&file).map_err(DataPoolError::RegistryLock)?;
            let existing = file.metadata()?.len() as usize;
            let owner = existing == 0;
            if owner {
                file.set_len(size as u64)?;
            }
            let map_size = if owner { size } else { existing };
            let dup = file.try_clone()?;
            let mut segment = Self::map(dup, path.clone(), name, map_size, owner)?;
            if owner {
                init(segment.as_mut_slice())?;
                segment.mmap.flush()?;
            }
            segment
        };
        segment.file = file;

        log::info!(
            "{} shared segment '{}' ({} bytes)",
            if segment.owner { "Created" } else { "Opened existing" },
            name,
            segment.size
        );
        Ok(segment)
    }

    fn map(file: File, path: PathBuf, name: &str, size: usize, owner: bool) -> DataPoolResult<Self> {
        let mut mmap = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
        let ptr = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| DataPoolError::CorruptSegment {
            name: name.to_string(),
            reason: "null mapping".to_string(),
        })?;

        Ok(Self {
            mmap,
            ptr,
            size,
            path,
            file,
            name: name.to_string(),
            owner,
        })
    }

    /// Non-destructive check for a segment file under `name`
    pub fn exists(base_dir: &Path, name: &str) -> DataPoolResult<bool> {
        match std::fs::metadata(segment_path(base_dir, name)) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// True while this handle's path still names the file it maps
    ///
    /// Compares device and inode, so a segment unlinked and then created
    /// again under the same name reports false.
    pub fn is_linked(&self) -> DataPoolResult<bool> {
        let named = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mapped = self.file.metadata()?;
        Ok(named.dev() == mapped.dev() && named.ino() == mapped.ino())
    }

    /// Remove the segment from the system
    ///
    /// Existing mappings in other processes stay valid until they are closed,
    /// but nobody can attach by name afterwards. Removing a segment that is
    /// already gone is not an error.
    pub fn unlink(&self) -> DataPoolResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                log::debug!("Unlinked shared segment '{}'", self.name);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("Shared segment '{}' was already unlinked", self.name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Raw pointer for writes into the shared mapping
    ///
    /// Other processes may write the same bytes at any time; callers treat the
    /// memory as racy and never hold references across such writes.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// View the mapping as an immutable slice
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.size) }
    }

    /// View the mapping as a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_then_open_shares_bytes() {
        let dir = tempdir().unwrap();
        let owner = SharedSegment::create(dir.path(), "seg", 64).unwrap();
        assert!(owner.is_owner());
        assert!(owner.as_slice().iter().all(|b| *b == 0));

        let attacher = SharedSegment::open(dir.path(), "seg").unwrap();
        assert!(!attacher.is_owner());
        assert_eq!(attacher.size(), 64);

        unsafe { *owner.as_mut_ptr().add(3) = 42 };
        assert_eq!(attacher.as_slice()[3], 42);
    }

    #[test]
    fn test_create_existing_name_fails() {
        let dir = tempdir().unwrap();
        let _first = SharedSegment::create(dir.path(), "dup", 8).unwrap();
        let second = SharedSegment::create(dir.path(), "dup", 8);
        assert!(matches!(second, Err(DataPoolError::DuplicateName(_))));
    }

    #[test]
    fn test_separator_names_do_not_collide() {
        let dir = tempdir().unwrap();
        let _slash = SharedSegment::create(dir.path(), "a/b", 8).unwrap();
        let _colon = SharedSegment::create(dir.path(), "a:b", 8).unwrap();
        let _plain = SharedSegment::create(dir.path(), "a_b", 8).unwrap();
        assert!(SharedSegment::exists(dir.path(), "a/b").unwrap());
        assert!(!SharedSegment::exists(dir.path(), "a\\b").unwrap());
    }

    #[test]
    fn test_unlink_removes_name_but_keeps_mapping() {
        let dir = tempdir().unwrap();
        let owner = SharedSegment::create(dir.path(), "gone", 16).unwrap();
        let attacher = SharedSegment::open(dir.path(), "gone").unwrap();

        owner.unlink().unwrap();
        assert!(!SharedSegment::exists(dir.path(), "gone").unwrap());
        assert!(matches!(
            SharedSegment::open(dir.path(), "gone"),
            Err(DataPoolError::SegmentGone(_))
        ));

        unsafe { *owner.as_mut_ptr() = 7 };
        assert_eq!(attacher.as_slice()[0], 7);

        // second unlink is a no-op
        owner.unlink().unwrap();
    }

    #[test]
    fn test_is_linked_tracks_file_identity() {
        let dir = tempdir().unwrap();
        let first = SharedSegment::create(dir.path(), "again", 8).unwrap();
        let attacher = SharedSegment::open(dir.path(), "again").unwrap();
        assert!(attacher.is_linked().unwrap());

        first.unlink().unwrap();
        assert!(!attacher.is_linked().unwrap());

        let second = SharedSegment::create(dir.path(), "again", 8).unwrap();
        assert!(second.is_linked().unwrap());
        assert!(!attacher.is_linked().unwrap());
        assert!(!first.is_linked().unwrap());
    }

    #[test]
    fn test_create_or_open_initialises_once() {
        let dir = tempdir().unwrap();
        let first = SharedSegment::create_or_open(dir.path(), "reg", 32, |bytes| {
            bytes[0] = 9;
            Ok(())
        })
        .unwrap();
        assert!(first.is_owner());

        let second = SharedSegment::create_or_open(dir.path(), "reg", 32, |bytes| {
            bytes[0] = 1;
            Ok(())
        })
        .unwrap();
        assert!(!second.is_owner());
        assert_eq!(second.as_slice()[0], 9);
    }
}
