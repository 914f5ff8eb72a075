use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::backends::BackendAdapter;
use crate::error::{Error, Result};
use crate::models::BackendConfig;

/// Stable handle for a registered backend. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendHandle(u64);

impl BackendHandle {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct BackendEntry {
    handle: BackendHandle,
    config: BackendConfig,
    adapter: Arc<dyn BackendAdapter>,
    healthy: AtomicBool,
    retired: AtomicBool,
}

impl BackendEntry {
    pub fn handle(&self) -> BackendHandle {
        self.handle
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Arc<dyn BackendAdapter> {
        &self.adapter
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEntry")
            .field("handle", &self.handle)
            .field("id", &self.config.id)
            .field("provider", &self.config.provider)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    entries: Vec<Arc<BackendEntry>>,
}

impl RegistrySnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<BackendEntry>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, handle: BackendHandle) -> Option<&Arc<BackendEntry>> {
        self.entries.iter().find(|e| e.handle == handle)
    }

    pub fn find(&self, id: &str) -> Option<&Arc<BackendEntry>> {
        self.entries.iter().find(|e| e.config.id == id)
    }
}

pub struct BackendRegistry {
    current: ArcSwap<RegistrySnapshot>,
    write_lock: Mutex<()>,
    next_handle: AtomicU64,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RegistrySnapshot::default()),
            write_lock: Mutex::new(()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.current.load().find(id).is_some()
    }

    pub fn insert(
        &self,
        config: BackendConfig,
        adapter: Arc<dyn BackendAdapter>,
        healthy: bool,
    ) -> Result<Arc<BackendEntry>> {
        let _guard = self.write_lock.lock();
        let current = self.current.load_full();

        if current.find(&config.id).is_some() {
            return Err(Error::configuration(format!(
                "backend id '{}' is already registered",
                config.id
            )));
        }

        let handle = BackendHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(BackendEntry {
            handle,
            config,
            adapter,
            healthy: AtomicBool::new(healthy),
            retired: AtomicBool::new(false),
        });

        let mut entries = current.entries.clone();
        entries.push(Arc::clone(&entry));
        self.current.store(Arc::new(RegistrySnapshot { entries }));

        info!("Registered backend '{}' as {}", entry.id(), handle);
        Ok(entry)
    }

    /// Removes a backend by id. The entry is marked retired and `on_removed`
    /// runs before the new snapshot is published.
    pub fn remove_with<F>(&self, id: &str, on_removed: F) -> Option<Arc<BackendEntry>>
    where
        F: FnOnce(&BackendEntry),
    {
        let _guard = self.write_lock.lock();
        let current = self.current.load_full();

        let position = current.entries.iter().position(|e| e.config.id == id)?;
        let mut entries = current.entries.clone();
        let removed = entries.remove(position);
        removed.retired.store(true, Ordering::Release);
        on_removed(&removed);
        self.current.store(Arc::new(RegistrySnapshot { entries }));

        debug!("Removed backend '{}' ({})", removed.id(), removed.handle);
        Some(removed)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
