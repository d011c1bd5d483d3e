use crate::block::{BlockDescriptor, DataBlock, Element, Value};
use crate::catalog::LocalCatalog;
use crate::config::PoolConfig;
use crate::error::{DataPoolError, DataPoolResult};
use crate::memory::platform::has_native_shm;
use crate::registry::SharedRegistry;
use crate::subscriber::{SubscriberHandle, SubscriberLoop, SubscriberState};
use ndarray::{ArrayBase, Data, Dimension};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One data pool instance: registry handle, local catalog and subscriber
///
/// Normally there is one per process. Tests open several with distinct
/// identities through [`open_as`](Self::open_as) to stand in for separate
/// processes.
pub struct DataPool {
    config: PoolConfig,
    base_dir: PathBuf,
    pid: u32,
    registry: Arc<SharedRegistry>,
    catalog: Arc<LocalCatalog>,
    subscriber: Mutex<Option<SubscriberHandle>>,
    shut_down: AtomicBool,
}

impl DataPool {
    /// Open (or create) the registry for this process
    pub fn open(config: PoolConfig) -> DataPoolResult<Self> {
        Self::open_as(config, std::process::id())
    }

    /// Open the registry under an explicit process identity
    pub fn open_as(config: PoolConfig, pid: u32) -> DataPoolResult<Self> {
        config.validate()?;
        let base_dir = config.base_dir();
        let registry = SharedRegistry::open(&config)?;

        log::info!(
            "Data pool opened at {} (pid {}, registry '{}' {}, native shm: {})",
            base_dir.display(),
            pid,
            registry.name(),
            if registry.is_owner() { "created" } else { "attached" },
            has_native_shm()
        );

        Ok(Self {
            config,
            base_dir,
            pid,
            registry: Arc::new(registry),
            catalog: Arc::new(LocalCatalog::new()),
            subscriber: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn process_id(&self) -> u32 {
        self.pid
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &LocalCatalog {
        &self.catalog
    }

    fn ensure_unused(&self, name: &str) -> DataPoolResult<()> {
        if self.catalog.contains(name) {
            return Err(DataPoolError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    /// Copy an array into a new shared block owned by this pool
    ///
    /// The block is not visible to anyone until it is [published](Self::publish).
    pub fn create_array<T, S, D>(
        &self,
        name: &str,
        data: &ArrayBase<S, D>,
        copy_on_read: bool,
    ) -> DataPoolResult<Arc<DataBlock>>
    where
        T: Element,
        S: Data<Elem = T>,
        D: Dimension,
    {
        self.ensure_unused(name)?;
        let block = DataBlock::create_array(&self.base_dir, name, data, self.pid, copy_on_read)?;
        Ok(Arc::new(block))
    }

    /// Create an array block from raw row-major bytes and a dtype tag
    pub fn create_array_from_bytes(
        &self,
        name: &str,
        bytes: &[u8],
        shape: &[usize],
        dtype_tag: &str,
        copy_on_read: bool,
    ) -> DataPoolResult<Arc<DataBlock>> {
        self.ensure_unused(name)?;
        let block = DataBlock::create_array_from_bytes(
            &self.base_dir,
            name,
            bytes,
            shape,
            dtype_tag,
            self.pid,
            copy_on_read,
        )?;
        Ok(Arc::new(block))
    }

    /// Create a fixed-length list or tuple block
    pub fn create_sequence(
        &self,
        name: &str,
        items: &[Value],
        is_tuple: bool,
        copy_on_read: bool,
    ) -> DataPoolResult<Arc<DataBlock>> {
        self.ensure_unused(name)?;
        let block =
            DataBlock::create_sequence(&self.base_dir, name, items, is_tuple, self.pid, copy_on_read)?;
        Ok(Arc::new(block))
    }

    /// Create a sequence block from a JSON array of primitives
    ///
    /// Anything but a flat array of null/bool/number/string items fails with
    /// [`DataPoolError::UnsupportedDataFormat`].
    pub fn create_sequence_json(
        &self,
        name: &str,
        items: serde_json::Value,
        is_tuple: bool,
        copy_on_read: bool,
    ) -> DataPoolResult<Arc<DataBlock>> {
        let items = match items {
            serde_json::Value::Array(items) => items,
            other => {
                return Err(DataPoolError::UnsupportedDataFormat(format!(
                    "expected a JSON array, found {}",
                    other
                )))
            }
        };
        let items = items
            .into_iter()
            .map(Value::try_from)
            .collect::<DataPoolResult<Vec<_>>>()?;
        self.create_sequence(name, &items, is_tuple, copy_on_read)
    }

    /// Register a block locally and broadcast its descriptor
    ///
    /// Publishing the handle that is already registered only logs a warning.
    /// On failure the block is left unregistered.
    pub fn publish(&self, block: &Arc<DataBlock>) -> DataPoolResult<()> {
        if let Ok(existing) = self.catalog.get(block.name()) {
            if Arc::ptr_eq(&existing, block) {
                log::warn!("Block '{}' is already published", block.name());
                return Ok(());
            }
            return Err(DataPoolError::DuplicateName(block.name().to_string()));
        }
        if !block.is_available() {
            return Err(DataPoolError::BlockClosed(block.name().to_string()));
        }

        let encoded = block.encode();
        if encoded.len() > self.registry.slot_width() {
            return Err(DataPoolError::SlotOverflow {
                len: encoded.len(),
                width: self.registry.slot_width(),
            });
        }

        self.catalog.insert_new(block.clone())?;
        match self.registry.publish(&encoded) {
            Ok(slot) => {
                log::info!("Published block '{}' in slot {}", block.name(), slot);
                Ok(())
            }
            Err(e) => {
                self.catalog.remove_if_same(block);
                Err(e)
            }
        }
    }

    /// Attach to a block from its registry descriptor and store it locally
    ///
    /// If the catalog already holds a live handle with the same descriptor,
    /// that handle is returned.
    pub fn attach(&self, encoded: &str) -> DataPoolResult<Arc<DataBlock>> {
        let descriptor = BlockDescriptor::decode(encoded)?;
        if self.catalog.is_current(&descriptor) {
            return self.catalog.get(&descriptor.name);
        }
        let block = Arc::new(DataBlock::from_descriptor(&self.base_dir, descriptor, self.pid)?);
        self.catalog.upsert(block.clone());
        Ok(block)
    }

    /// Look up a block in the local catalog
    pub fn get_block(&self, name: &str) -> DataPoolResult<Arc<DataBlock>> {
        self.catalog.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.catalog.contains(name)
    }

    /// Names of every block in the local catalog, sorted
    pub fn names(&self) -> Vec<String> {
        self.catalog.names()
    }

    pub fn blocks(&self) -> Vec<Arc<DataBlock>> {
        self.catalog.blocks()
    }

    /// Close a block by name and drop it from the catalog
    ///
    /// The owner unlinks the segment; an attacher only detaches.
    pub fn close(&self, name: &str) -> DataPoolResult<()> {
        let block = self
            .catalog
            .remove(name)
            .ok_or_else(|| DataPoolError::BlockNotFound(name.to_string()))?;
        block.close()
    }

    /// Close a handle, removing it from the catalog if it is registered there
    ///
    /// Closing an already closed block is a no-op.
    pub fn close_block(&self, block: &Arc<DataBlock>) -> DataPoolResult<()> {
        self.catalog.remove_if_same(block);
        block.close()
    }

    /// Close every cataloged block; the first failure is returned after all were tried
    pub fn close_all(&self) -> DataPoolResult<()> {
        let mut first_error = None;
        for block in self.catalog.drain() {
            if let Err(e) = block.close() {
                log::error!("Failed to close block '{}': {}", block.name(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Prune catalog entries whose segment is gone; returns the pruned names
    pub fn check_alive(&self) -> Vec<String> {
        self.catalog
            .check_alive(&self.base_dir, self.config.health_check_retries)
    }

    /// A polling loop bound to this pool, not yet running
    pub fn subscriber(&self) -> SubscriberLoop {
        SubscriberLoop::new(self.registry.clone(), self.catalog.clone(), &self.config, self.pid)
    }

    /// Start the background subscriber; does nothing if one is already running
    pub fn start_subscriber(&self) -> DataPoolResult<()> {
        let mut slot = self.subscriber.lock();
        if let Some(handle) = slot.as_ref() {
            if handle.state() == SubscriberState::Polling {
                log::debug!("Subscriber already running");
                return Ok(());
            }
        }
        *slot = Some(self.subscriber().start()?);
        Ok(())
    }

    /// Stop the background subscriber, waiting for its thread to exit
    pub fn stop_subscriber(&self) {
        if let Some(mut handle) = self.subscriber.lock().take() {
            handle.stop();
        }
    }

    pub fn subscriber_state(&self) -> SubscriberState {
        self.subscriber
            .lock()
            .as_ref()
            .map_or(SubscriberState::Stopped, SubscriberHandle::state)
    }

    /// Stop the subscriber, close every block and, if this instance created
    /// the registry, unlink it. Later calls do nothing.
    pub fn shutdown(&self) -> DataPoolResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.stop_subscriber();
        let closed = self.close_all();
        if self.registry.is_owner() {
            self.registry.unlink()?;
            log::info!("Unlinked registry '{}'", self.registry.name());
        }
        log::info!("Data pool (pid {}) shut down", self.pid);
        closed
    }
}

impl Drop for DataPool {
    fn drop(&mut self) {
        self.stop_subscriber();
    }
}
