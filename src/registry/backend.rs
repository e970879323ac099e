use super::RegistryEntry;
use crate::RegistryError;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// The storage and API of the remote registry.
///
/// `monitor` is a long-poll: it returns `Ok(true)` when any of the keys changed, or `Ok(false)`
/// when its wait timed out without change.
pub trait RegistryBackend: Send + Sync + 'static {
    fn register(&self, entries: &[RegistryEntry]) -> impl Future<Output = Result<bool, RegistryError>> + Send;

    fn remove(&self, entries: &[RegistryEntry]) -> impl Future<Output = Result<bool, RegistryError>> + Send;

    fn discover(
        &self, keys: &HashSet<String>,
    ) -> impl Future<Output = Result<HashMap<String, Vec<String>>, RegistryError>> + Send;

    fn monitor(&self, keys: &HashSet<String>) -> impl Future<Output = Result<bool, RegistryError>> + Send;
}

#[derive(Default)]
struct Store {
    data: HashMap<String, BTreeSet<String>>,
    versions: HashMap<String, u64>,
    version: u64,
}

impl Store {
    fn bump(&mut self, key: &str) {
        self.version += 1;
        self.versions.insert(key.to_string(), self.version);
    }

    #[inline]
    fn version_of(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }
}

struct MemoryInner {
    store: RwLock<Store>,
    notify: watch::Sender<u64>,
    monitor_timeout: Duration,
    offline: AtomicBool,
}

/// An in-process registry, for single-host deployment and tests.
///
/// Clones share the storage, but each clone is a separate session: [monitor](RegistryBackend::monitor)
/// reports a key as changed when its version differs from the one this session last saw in
/// `discover`.
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
    seen: Mutex<HashMap<String, u64>>,
}

impl Clone for MemoryBackend {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), seen: Mutex::new(HashMap::new()) }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl MemoryBackend {
    /// `monitor_timeout` bounds the wait of [RegistryBackend::monitor]
    pub fn new(monitor_timeout: Duration) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            inner: Arc::new(MemoryInner {
                store: RwLock::new(Store::default()),
                notify,
                monitor_timeout,
                offline: AtomicBool::new(false),
            }),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Simulate an unreachable registry, all calls fail with network error
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::Release);
    }

    fn check_online(&self) -> Result<(), RegistryError> {
        if self.inner.offline.load(Ordering::Acquire) {
            return Err(RegistryError::Network("registry offline".to_string()));
        }
        Ok(())
    }

    /// Values of `key` currently stored
    pub fn get(&self, key: &str) -> BTreeSet<String> {
        self.inner.store.read().data.get(key).cloned().unwrap_or_default()
    }

    fn publish(&self, version: u64) {
        self.inner.notify.send_replace(version);
    }
}

impl RegistryBackend for MemoryBackend {
    async fn register(&self, entries: &[RegistryEntry]) -> Result<bool, RegistryError> {
        self.check_online()?;
        let version = {
            let mut store = self.inner.store.write();
            for entry in entries {
                let inserted = store.data.entry(entry.key.clone()).or_default().insert(entry.value.clone());
                if inserted {
                    store.bump(&entry.key);
                }
            }
            store.version
        };
        self.publish(version);
        Ok(true)
    }

    async fn remove(&self, entries: &[RegistryEntry]) -> Result<bool, RegistryError> {
        self.check_online()?;
        let version = {
            let mut store = self.inner.store.write();
            for entry in entries {
                let removed = match store.data.get_mut(&entry.key) {
                    Some(values) => values.remove(&entry.value),
                    None => false,
                };
                if removed {
                    store.bump(&entry.key);
                }
            }
            store.version
        };
        self.publish(version);
        Ok(true)
    }

    async fn discover(&self, keys: &HashSet<String>) -> Result<HashMap<String, Vec<String>>, RegistryError> {
        self.check_online()?;
        let store = self.inner.store.read();
        let mut seen = self.seen.lock();
        let mut res = HashMap::with_capacity(keys.len());
        for k in keys {
            seen.insert(k.clone(), store.version_of(k));
            res.insert(k.clone(), store.data.get(k).map(|v| v.iter().cloned().collect()).unwrap_or_default());
        }
        Ok(res)
    }

    async fn monitor(&self, keys: &HashSet<String>) -> Result<bool, RegistryError> {
        self.check_online()?;
        let mut rx = self.inner.notify.subscribe();
        // Keys never discovered by this session are compared with the version at call time
        let base: HashMap<&String, u64> = {
            let store = self.inner.store.read();
            let seen = self.seen.lock();
            keys.iter().map(|k| (k, seen.get(k).copied().unwrap_or_else(|| store.version_of(k)))).collect()
        };
        let deadline = tokio::time::Instant::now() + self.inner.monitor_timeout;
        loop {
            let changed = {
                let store = self.inner.store.read();
                base.iter().any(|(k, v)| store.version_of(k) != *v)
            };
            if changed {
                return Ok(true);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => return Ok(false),
            }
        }
    }
}
