use crate::block::{BlockDescriptor, DataBlock};
use crate::error::{DataPoolError, DataPoolResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Per-instance map of block name to block handle
///
/// Shared between the owning [`DataPool`](crate::DataPool) and its
/// subscriber thread. Entries are never touched by other processes.
#[derive(Debug, Default)]
pub struct LocalCatalog {
    blocks: RwLock<HashMap<String, Arc<DataBlock>>>,
}

/// Outcome of [`LocalCatalog::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

impl LocalCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a block by name
    pub fn get(&self, name: &str) -> DataPoolResult<Arc<DataBlock>> {
        self.blocks
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DataPoolError::BlockNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.blocks.read().contains_key(name)
    }

    /// Insert a block whose name must not be present yet
    pub fn insert_new(&self, block: Arc<DataBlock>) -> DataPoolResult<()> {
        let mut blocks = self.blocks.write();
        if blocks.contains_key(block.name()) {
            return Err(DataPoolError::DuplicateName(block.name().to_string()));
        }
        blocks.insert(block.name().to_string(), block);
        Ok(())
    }

    /// True if an available entry already has exactly this descriptor
    ///
    /// Checked before attaching. An owned entry always counts, so a process
    /// seeing its own publish through the registry leaves it untouched. An
    /// attached entry counts only while its mapping is still the segment
    /// linked under the name; a block closed and created again by its owner
    /// is attached afresh.
    pub fn is_current(&self, descriptor: &BlockDescriptor) -> bool {
        let existing = self.blocks.read().get(&descriptor.name).cloned();
        existing.is_some_and(|block| {
            block.is_available()
                && block.descriptor() == descriptor
                && (block.is_owner() || block.maps_linked_segment())
        })
    }

    /// Insert or replace the entry for `block.name()`, closing a replaced entry
    pub fn upsert(&self, block: Arc<DataBlock>) -> Upsert {
        let previous = self.blocks.write().insert(block.name().to_string(), block);
        match previous {
            Some(old) => {
                if let Err(e) = old.close() {
                    log::warn!("Failed to close replaced block '{}': {}", old.name(), e);
                }
                Upsert::Replaced
            }
            None => Upsert::Inserted,
        }
    }

    /// Remove an entry without closing it
    pub fn remove(&self, name: &str) -> Option<Arc<DataBlock>> {
        self.blocks.write().remove(name)
    }

    /// Remove `name` only if it still maps to this exact handle
    pub fn remove_if_same(&self, block: &Arc<DataBlock>) -> bool {
        let mut blocks = self.blocks.write();
        match blocks.get(block.name()) {
            Some(current) if Arc::ptr_eq(current, block) => {
                blocks.remove(block.name());
                true
            }
            _ => false,
        }
    }

    /// Sorted block names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.blocks.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn blocks(&self) -> Vec<Arc<DataBlock>> {
        self.blocks.read().values().cloned().collect()
    }

    /// Take every entry out of the catalog
    pub fn drain(&self) -> Vec<Arc<DataBlock>> {
        self.blocks.write().drain().map(|(_, block)| block).collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Drop entries whose backing segment has disappeared
    ///
    /// Each missing block is removed and its local handle closed. A scan that
    /// hits an unexpected error is retried up to `retries` times; after that
    /// the cycle is abandoned with an error log. Returns the pruned names.
    pub fn check_alive(&self, base_dir: &Path, retries: u32) -> Vec<String> {
        let mut pruned = Vec::new();
        let attempts = retries.max(1);

        for attempt in 1..=attempts {
            match self.scan_once(base_dir, &mut pruned) {
                Ok(()) => return pruned,
                Err(e) if attempt < attempts => {
                    log::debug!("Health check attempt {}/{} failed: {}", attempt, attempts, e);
                }
                Err(e) => {
                    log::error!("Health check gave up after {} attempts: {}", attempts, e);
                }
            }
        }
        pruned
    }

    fn scan_once(&self, base_dir: &Path, pruned: &mut Vec<String>) -> DataPoolResult<()> {
        for block in self.blocks() {
            let alive = block.is_available() && block.segment_exists(base_dir)?;
            if alive {
                continue;
            }
            if !self.remove_if_same(&block) {
                continue;
            }
            log::info!("Segment of block '{}' is gone, removed from catalog", block.name());
            if let Err(e) = block.close() {
                log::warn!("Failed to close pruned block '{}': {}", block.name(), e);
            }
            pruned.push(block.name().to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Value;
    use tempfile::tempdir;

    const OWNER: u32 = 10;
    const OTHER: u32 = 20;

    fn sequence(dir: &Path, name: &str, pid: u32) -> Arc<DataBlock> {
        Arc::new(DataBlock::create_sequence(dir, name, &[Value::Int(1)], false, pid, false).unwrap())
    }

    #[test]
    fn test_insert_and_lookup() {
        let dir = tempdir().unwrap();
        let catalog = LocalCatalog::new();
        catalog.insert_new(sequence(dir.path(), "b", OWNER)).unwrap();
        catalog.insert_new(sequence(dir.path(), "a", OWNER)).unwrap();

        assert_eq!(catalog.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(catalog.get("a").unwrap().name(), "a");
        assert!(matches!(
            catalog.get("zzz"),
            Err(DataPoolError::BlockNotFound(name)) if name == "zzz"
        ));
    }

    #[test]
    fn test_insert_duplicate_rejected() {
        let dir = tempdir().unwrap();
        let catalog = LocalCatalog::new();
        let block = sequence(dir.path(), "dup", OWNER);
        catalog.insert_new(block.clone()).unwrap();

        let attached = Arc::new(DataBlock::attach(dir.path(), &block.encode(), OTHER).unwrap());
        assert!(matches!(
            catalog.insert_new(attached),
            Err(DataPoolError::DuplicateName(_))
        ));
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_own_descriptor_is_current() {
        let dir = tempdir().unwrap();
        let catalog = LocalCatalog::new();
        let owned = sequence(dir.path(), "self", OWNER);
        catalog.insert_new(owned.clone()).unwrap();

        let seen = BlockDescriptor::decode(&owned.encode()).unwrap();
        assert!(catalog.is_current(&seen));

        owned.close().unwrap();
        assert!(!catalog.is_current(&seen));
    }

    #[test]
    fn test_upsert_replaces_and_closes_stale_entry() {
        let dir = tempdir().unwrap();
        let catalog = LocalCatalog::new();
        let first = sequence(dir.path(), "first", OWNER);
        let stale = Arc::new(DataBlock::attach(dir.path(), &first.encode(), OTHER).unwrap());
        assert_eq!(catalog.upsert(stale.clone()), Upsert::Inserted);

        stale.close().unwrap();
        let fresh = Arc::new(DataBlock::attach(dir.path(), &first.encode(), OTHER).unwrap());
        assert_eq!(catalog.upsert(fresh.clone()), Upsert::Replaced);
        assert!(Arc::ptr_eq(&catalog.get("first").unwrap(), &fresh));
    }

    #[test]
    fn test_check_alive_prunes_missing_segments() {
        let dir = tempdir().unwrap();
        let catalog = LocalCatalog::new();
        let owned = sequence(dir.path(), "gone", OWNER);
        let attached = Arc::new(DataBlock::attach(dir.path(), &owned.encode(), OTHER).unwrap());
        catalog.insert_new(attached.clone()).unwrap();
        catalog.insert_new(sequence(dir.path(), "kept", OTHER)).unwrap();

        owned.close().unwrap();
        let pruned = catalog.check_alive(dir.path(), 3);
        assert_eq!(pruned, vec!["gone".to_string()]);
        assert_eq!(catalog.names(), vec!["kept".to_string()]);
        assert!(!attached.is_available());

        assert!(catalog.check_alive(dir.path(), 3).is_empty());
    }

    #[test]
    fn test_attached_entry_stale_after_recreate() {
        let dir = tempdir().unwrap();
        let catalog = LocalCatalog::new();
        let first = sequence(dir.path(), "again", OWNER);
        let attached = Arc::new(DataBlock::attach(dir.path(), &first.encode(), OTHER).unwrap());
        catalog.insert_new(attached.clone()).unwrap();

        let seen = BlockDescriptor::decode(&first.encode()).unwrap();
        assert!(catalog.is_current(&seen));

        first.close().unwrap();
        let second = sequence(dir.path(), "again", OWNER);
        assert_eq!(second.descriptor(), &seen);
        assert!(!catalog.is_current(&seen));

        assert_eq!(catalog.check_alive(dir.path(), 1), vec!["again".to_string()]);
        assert!(!attached.is_available());
    }

    #[test]
    fn test_check_alive_gives_up_on_scan_errors() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("segments");
        let catalog = LocalCatalog::new();
        let owned = sequence(&sub, "lost", OWNER);
        let attached = Arc::new(DataBlock::attach(&sub, &owned.encode(), OTHER).unwrap());
        catalog.insert_new(attached.clone()).unwrap();

        // a plain file where the directory was makes every lookup fail with ENOTDIR
        owned.close().unwrap();
        std::fs::remove_dir(&sub).unwrap();
        std::fs::write(&sub, b"").unwrap();

        assert!(attached.segment_exists(&sub).is_err());
        assert!(catalog.check_alive(&sub, 3).is_empty());
        assert!(catalog.contains("lost"));
        assert!(attached.is_available());
    }

    #[test]
    fn test_drain_empties_catalog() {
        let dir = tempdir().unwrap();
        let catalog = LocalCatalog::new();
        catalog.insert_new(sequence(dir.path(), "x", OWNER)).unwrap();
        assert_eq!(catalog.drain().len(), 1);
        assert!(catalog.is_empty());
    }
}
