//! Background discovery of blocks published by other processes
//!
//! One subscriber per pool instance polls the registry cursor, attaches every
//! descriptor it has not seen and upserts the result into the local catalog.
//! Every `health_check_every` iterations it also prunes catalog entries whose
//! segment has been released by its owner.

use crate::block::{BlockDescriptor, DataBlock};
use crate::catalog::{LocalCatalog, Upsert};
use crate::config::PoolConfig;
use crate::error::{DataPoolError, DataPoolResult};
use crate::registry::SharedRegistry;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Result of one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    /// Cursor has not moved since the last poll
    Idle,
    /// A block was attached and stored under this name
    Attached(String),
    /// An entry was consumed without changing the catalog
    Skipped,
}

/// Lifecycle of a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Stopped,
    Polling,
}

/// Registry polling state for one pool instance
pub struct SubscriberLoop {
    registry: Arc<SharedRegistry>,
    catalog: Arc<LocalCatalog>,
    base_dir: PathBuf,
    local_pid: u32,
    last_seen: u64,
    iterations: u64,
    poll_interval: Duration,
    health_check_every: u64,
    health_check_retries: u32,
}

impl SubscriberLoop {
    pub fn new(
        registry: Arc<SharedRegistry>,
        catalog: Arc<LocalCatalog>,
        config: &PoolConfig,
        local_pid: u32,
    ) -> Self {
        Self {
            registry,
            catalog,
            base_dir: config.base_dir(),
            local_pid,
            last_seen: 0,
            iterations: 0,
            poll_interval: config.poll_interval(),
            health_check_every: u64::from(config.health_check_every.max(1)),
            health_check_retries: config.health_check_retries,
        }
    }

    /// Sequence number of the last registry entry consumed (0: none yet)
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Consume at most one registry entry
    ///
    /// If the publishers have lapped this subscriber, the overwritten entries
    /// are reported as missed and polling resumes at the oldest intact one.
    pub fn poll_once(&mut self) -> Poll {
        let current = self.registry.cursor().sequence();
        if current <= self.last_seen {
            return Poll::Idle;
        }

        let capacity = self.registry.capacity() as u64;
        let oldest = current.saturating_sub(capacity - 1).max(1);
        if self.last_seen + 1 < oldest {
            log::warn!(
                "Missed {} registry entries (publishers lapped the subscriber)",
                oldest - self.last_seen - 1
            );
            self.last_seen = oldest - 1;
        }

        self.last_seen += 1;
        let seq = self.last_seen;
        match self.registry.read_entry(seq) {
            Ok(Some(encoded)) => self.consume(&encoded),
            Ok(None) => {
                log::warn!("Registry entry {} was overwritten before it could be read", seq);
                Poll::Skipped
            }
            Err(e) => {
                log::warn!("Skipping registry entry {}: {}", seq, e);
                Poll::Skipped
            }
        }
    }

    /// Poll until the cursor has nothing new, returning the attached names
    pub fn catch_up(&mut self) -> Vec<String> {
        let mut attached = Vec::new();
        loop {
            match self.poll_once() {
                Poll::Idle => return attached,
                Poll::Attached(name) => attached.push(name),
                Poll::Skipped => {}
            }
        }
    }

    fn consume(&self, encoded: &str) -> Poll {
        match self.attach(encoded) {
            Ok(Some(block)) => {
                let name = block.name().to_string();
                match self.catalog.upsert(block) {
                    Upsert::Inserted => log::debug!("Discovered block '{}'", name),
                    Upsert::Replaced => log::debug!("Replaced block '{}'", name),
                }
                Poll::Attached(name)
            }
            Ok(None) => Poll::Skipped,
            Err(e) if e.is_segment_gone() => {
                log::debug!("Block '{}' was released before it could be attached", encoded);
                Poll::Skipped
            }
            Err(e) => {
                log::warn!("Cannot attach '{}': {}", encoded, e);
                Poll::Skipped
            }
        }
    }

    fn attach(&self, encoded: &str) -> DataPoolResult<Option<Arc<DataBlock>>> {
        let descriptor = BlockDescriptor::decode(encoded)?;
        if self.catalog.is_current(&descriptor) {
            return Ok(None);
        }
        let block = DataBlock::from_descriptor(&self.base_dir, descriptor, self.local_pid)?;
        Ok(Some(Arc::new(block)))
    }

    /// One loop iteration; returns false when there was nothing to consume
    fn tick(&mut self) -> bool {
        self.iterations += 1;
        if self.iterations % self.health_check_every == 0 {
            let pruned = self
                .catalog
                .check_alive(&self.base_dir, self.health_check_retries);
            if !pruned.is_empty() {
                log::info!("Health check pruned {:?}", pruned);
            }
        }
        self.poll_once() != Poll::Idle
    }

    /// Move the loop onto its own thread
    ///
    /// The loop cannot be restarted once stopped; build a new one instead.
    pub fn start(mut self) -> DataPoolResult<SubscriberHandle> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let thread = thread::Builder::new()
            .name("datapool-subscriber".to_string())
            .spawn(move || {
                log::debug!("Subscriber started at sequence {}", self.last_seen);
                while flag.load(Ordering::Acquire) {
                    if !self.tick() {
                        thread::park_timeout(self.poll_interval);
                    }
                }
                log::debug!("Subscriber stopped at sequence {}", self.last_seen);
            })
            .map_err(DataPoolError::Io)?;

        Ok(SubscriberHandle {
            running,
            thread: Some(thread),
        })
    }
}

/// Handle to a running subscriber thread
#[derive(Debug)]
pub struct SubscriberHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SubscriberHandle {
    pub fn state(&self) -> SubscriberState {
        if self.running.load(Ordering::Acquire) && self.thread.is_some() {
            SubscriberState::Polling
        } else {
            SubscriberState::Stopped
        }
    }

    /// Signal the loop and wait for it to exit
    ///
    /// The flag is checked at the top of each iteration; the sleeping thread is
    /// woken so shutdown does not wait out a full poll interval.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                log::error!("Subscriber thread panicked");
            }
        }
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Value;
    use std::path::Path;
    use tempfile::tempdir;

    const PUBLISHER: u32 = 1;
    const WATCHER: u32 = 2;

    fn config(dir: &Path, capacity: usize) -> PoolConfig {
        PoolConfig {
            capacity,
            poll_interval_ms: 10,
            health_check_every: 2,
            ..PoolConfig::with_base_dir(dir)
        }
    }

    fn publish(dir: &Path, registry: &SharedRegistry, name: &str) -> DataBlock {
        let block = DataBlock::create_sequence(dir, name, &[Value::Int(7)], false, PUBLISHER, false).unwrap();
        registry.publish(&block.encode()).unwrap();
        block
    }

    #[test]
    fn test_poll_attaches_new_entries() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 4);
        let registry = Arc::new(SharedRegistry::open(&cfg).unwrap());
        let catalog = Arc::new(LocalCatalog::new());
        let mut subscriber = SubscriberLoop::new(registry.clone(), catalog.clone(), &cfg, WATCHER);

        assert_eq!(subscriber.poll_once(), Poll::Idle);
        let _a = publish(dir.path(), &registry, "a");
        assert_eq!(subscriber.poll_once(), Poll::Attached("a".to_string()));
        assert_eq!(subscriber.poll_once(), Poll::Idle);

        let block = catalog.get("a").unwrap();
        assert!(!block.is_owner());
        assert_eq!(block.get_item(0).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_lapped_subscriber_sees_last_capacity_entries() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 3);
        let registry = Arc::new(SharedRegistry::open(&cfg).unwrap());
        let catalog = Arc::new(LocalCatalog::new());
        let mut subscriber = SubscriberLoop::new(registry.clone(), catalog.clone(), &cfg, WATCHER);

        let _blocks: Vec<DataBlock> = (0..5)
            .map(|i| publish(dir.path(), &registry, &format!("b{}", i)))
            .collect();

        assert_eq!(subscriber.catch_up(), vec!["b2", "b3", "b4"]);
        assert_eq!(subscriber.last_seen(), 5);
        assert_eq!(catalog.names(), vec!["b2", "b3", "b4"]);
    }

    #[test]
    fn test_bad_entries_are_skipped() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 4);
        let registry = Arc::new(SharedRegistry::open(&cfg).unwrap());
        let catalog = Arc::new(LocalCatalog::new());
        let mut subscriber = SubscriberLoop::new(registry.clone(), catalog.clone(), &cfg, WATCHER);

        registry.publish("garbage").unwrap();
        registry.publish("ghost;1;list;9;0").unwrap();
        let _x = publish(dir.path(), &registry, "x");
        registry.publish("x;4294967296,4294967296;int64;1;0").unwrap();
        assert_eq!(subscriber.poll_once(), Poll::Skipped);
        assert_eq!(subscriber.poll_once(), Poll::Skipped);
        assert_eq!(subscriber.poll_once(), Poll::Attached("x".to_string()));
        assert_eq!(subscriber.poll_once(), Poll::Skipped);
        assert_eq!(subscriber.poll_once(), Poll::Idle);
        assert_eq!(catalog.names(), vec!["x"]);
    }

    #[test]
    fn test_own_publish_leaves_catalog_entry() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 4);
        let registry = Arc::new(SharedRegistry::open(&cfg).unwrap());
        let catalog = Arc::new(LocalCatalog::new());
        let mut subscriber = SubscriberLoop::new(registry.clone(), catalog.clone(), &cfg, PUBLISHER);

        let own = Arc::new(publish(dir.path(), &registry, "mine"));
        catalog.insert_new(own.clone()).unwrap();

        assert_eq!(subscriber.poll_once(), Poll::Skipped);
        assert!(Arc::ptr_eq(&catalog.get("mine").unwrap(), &own));
        assert!(own.segment_exists(dir.path()).unwrap());
    }

    #[test]
    fn test_started_loop_discovers_and_stops() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 4);
        let registry = Arc::new(SharedRegistry::open(&cfg).unwrap());
        let catalog = Arc::new(LocalCatalog::new());
        let subscriber = SubscriberLoop::new(registry.clone(), catalog.clone(), &cfg, WATCHER);

        let mut handle = subscriber.start().unwrap();
        assert_eq!(handle.state(), SubscriberState::Polling);

        let _late = publish(dir.path(), &registry, "late");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !catalog.contains("late") && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(catalog.contains("late"));

        handle.stop();
        assert_eq!(handle.state(), SubscriberState::Stopped);
        handle.stop();
    }

    #[test]
    fn test_started_loop_prunes_released_blocks() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 4);
        let registry = Arc::new(SharedRegistry::open(&cfg).unwrap());
        let catalog = Arc::new(LocalCatalog::new());
        let subscriber = SubscriberLoop::new(registry.clone(), catalog.clone(), &cfg, WATCHER);
        let mut handle = subscriber.start().unwrap();

        let block = publish(dir.path(), &registry, "short_lived");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !catalog.contains("short_lived") && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let seen = catalog.get("short_lived").unwrap();

        block.close().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while catalog.contains("short_lived") && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!catalog.contains("short_lived"));
        assert!(!seen.is_available());
        handle.stop();
    }
}
