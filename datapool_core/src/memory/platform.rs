// Cross-platform shared memory path abstraction
//
// Linux: /dev/shm/datapool (tmpfs - RAM-backed)
// Other Unix: /tmp/datapool (regular filesystem, still fine for IPC)

use crate::error::{DataPoolError, DataPoolResult};
use std::path::{Path, PathBuf};

/// Prefix for every segment file so unrelated files in the directory are never touched
const SEGMENT_PREFIX: &str = "dp_";

/// Get the base directory for data pool shared memory
///
/// This returns a platform-appropriate path:
/// - Linux: `/dev/shm/datapool` (tmpfs)
/// - others: `/tmp/datapool`
pub fn shm_base_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/dev/shm/datapool")
    }

    #[cfg(not(target_os = "linux"))]
    {
        // No /dev/shm, /tmp is still fast enough for IPC
        PathBuf::from("/tmp/datapool")
    }
}

/// Check if we're running on a platform with true shared memory (tmpfs)
pub fn has_native_shm() -> bool {
    cfg!(target_os = "linux")
}

/// Validate a block or registry name
///
/// Names travel inside `;`-delimited descriptors, so `;` is rejected, and a
/// name must hold at least one character other than separators and dots.
pub fn validate_name(name: &str) -> DataPoolResult<()> {
    if name.is_empty() {
        return Err(DataPoolError::DataNameEmpty);
    }
    if name.contains(';') || name.contains('\0') || name.trim() != name {
        return Err(DataPoolError::InvalidName(name.to_string()));
    }
    if name.chars().all(|c| c == '/' || c == ':' || c == '.') {
        return Err(DataPoolError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Convert a block name to a safe file name
///
/// Separators are percent-escaped (and `%` itself), so distinct names never
/// share a file.
pub fn safe_file_name(name: &str) -> String {
    let mut file_name = String::with_capacity(SEGMENT_PREFIX.len() + name.len());
    file_name.push_str(SEGMENT_PREFIX);
    for c in name.chars() {
        match c {
            '%' => file_name.push_str("%25"),
            '/' => file_name.push_str("%2F"),
            ':' => file_name.push_str("%3A"),
            '\\' => file_name.push_str("%5C"),
            c => file_name.push(c),
        }
    }
    file_name
}

/// Path of the file backing the segment `name`
pub fn segment_path(base_dir: &Path, name: &str) -> PathBuf {
    base_dir.join(safe_file_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shm_paths_are_valid() {
        let base = shm_base_dir();
        assert!(!base.as_os_str().is_empty());

        let seg = segment_path(&base, "/expmatrix");
        assert!(seg.starts_with(&base));
        assert_eq!(seg.file_name().unwrap(), "dp_%2Fexpmatrix");
    }

    #[test]
    fn test_distinct_names_get_distinct_files() {
        let names = ["a/b", "a:b", "a\\b", "a_b", "a%2Fb"];
        let mut files: Vec<String> = names.iter().map(|n| safe_file_name(n)).collect();
        files.sort();
        files.dedup();
        assert_eq!(files.len(), names.len());
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("camera/frame").is_ok());
        assert!(matches!(validate_name(""), Err(DataPoolError::DataNameEmpty)));
        assert!(matches!(
            validate_name("a;b"),
            Err(DataPoolError::InvalidName(_))
        ));
        assert!(validate_name("//").is_err());
        assert!(validate_name(" padded").is_err());
    }
}
