//! The registry client.
//!
//! [RegistryClient] owns the local registration set and the [DiscoveryCache]. Once started, two
//! background coroutines keep them in sync with the [RegistryBackend]:
//!
//! - republish: sends the whole registration set every `register_interval`, so the entries of this
//!   node stay alive on the registry.
//! - discovery: long-polls `monitor` on the subscribed keys (the keys present in the cache), and
//!   refreshes them afterwards. When nothing is subscribed it sleeps `discovery_idle_interval`,
//!   and after a monitor reporting no change (or failing) it backs off `monitor_backoff`.
//!
//! Errors of the background loops are logged and retried on the next cycle.

use crate::{RegistryConfig, RegistryError};
use crossfire::{MAsyncRx, MAsyncTx, mpmc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

mod backend;
pub use backend::*;

mod cache;
pub use cache::DiscoveryCache;

mod entry;
pub use entry::*;

struct RegistryInner<B: RegistryBackend> {
    backend: B,
    config: RegistryConfig,
    registered: RwLock<HashSet<RegistryEntry>>,
    cache: DiscoveryCache,
    stopped: AtomicBool,
    // Dropped on stop to wake up the loops
    stop_tx: Mutex<Option<MAsyncTx<()>>>,
}

pub struct RegistryClient<B: RegistryBackend> {
    inner: Arc<RegistryInner<B>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<B: RegistryBackend> RegistryClient<B> {
    pub fn new(backend: B, config: RegistryConfig) -> Self {
        let inner = RegistryInner {
            backend,
            config,
            registered: RwLock::new(HashSet::new()),
            cache: DiscoveryCache::new(),
            stopped: AtomicBool::new(true),
            stop_tx: Mutex::new(None),
        };
        Self { inner: Arc::new(inner), tasks: tokio::sync::Mutex::new(Vec::new()) }
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    #[inline]
    pub fn cache(&self) -> &DiscoveryCache {
        &self.inner.cache
    }

    /// Spawn the republish and discovery loops. Does nothing if already running.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        let (stop_tx, stop_rx) = mpmc::bounded_async::<()>(1);
        self.inner.stop_tx.lock().replace(stop_tx);
        self.inner.stopped.store(false, Ordering::Release);
        tasks.push(tokio::spawn(register_loop(self.inner.clone(), stop_rx.clone())));
        tasks.push(tokio::spawn(discovery_loop(self.inner.clone(), stop_rx)));
        info!("registry client started");
    }

    /// Stop the loops and wait for them to exit.
    ///
    /// Sleeps and the monitor wait are interrupted, requests already issued to the backend
    /// are allowed to finish.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.stop_tx.lock().take();
        if tasks.is_empty() {
            return;
        }
        for th in tasks.drain(..) {
            if let Err(e) = th.await {
                warn!("registry loop exit abnormally: {}", e);
            }
        }
        info!("registry client stopped");
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::Acquire)
    }

    /// Add to the local registration set and send them to the backend.
    ///
    /// A backend failure is only logged, the republish loop will retry.
    pub async fn register(&self, entries: &[RegistryEntry]) -> Result<bool, RegistryError> {
        validate_entries(entries)?;
        self.inner.registered.write().extend(entries.iter().cloned());
        match self.inner.backend.register(entries).await {
            Ok(_) => info!("registry register {:?}", entries),
            Err(e) => warn!("registry register {:?} failed: {}", entries, e),
        }
        Ok(true)
    }

    /// Remove from the local registration set and from the backend
    pub async fn remove(&self, entries: &[RegistryEntry]) -> Result<bool, RegistryError> {
        validate_entries(entries)?;
        {
            let mut registered = self.inner.registered.write();
            for entry in entries {
                registered.remove(entry);
            }
        }
        match self.inner.backend.remove(entries).await {
            Ok(_) => info!("registry remove {:?}", entries),
            Err(e) => warn!("registry remove {:?} failed: {}", entries, e),
        }
        Ok(true)
    }

    /// A snapshot of the local registration set
    pub fn registered(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self.inner.registered.read().iter().cloned().collect();
        entries.sort();
        entries
    }

    /// Cached values of `keys`. On any cache miss, refresh the requested keys once from the
    /// backend. Keys unknown to the backend are absent from the result.
    pub async fn discover(&self, keys: &HashSet<String>) -> HashMap<String, BTreeSet<String>> {
        if keys.is_empty() {
            return HashMap::new();
        }
        let (found, complete) = self.inner.cache.lookup(keys);
        if complete {
            return found;
        }
        self.inner.refresh(keys).await;
        self.inner.cache.lookup(keys).0
    }

    pub async fn discover_one(&self, key: &str) -> Option<BTreeSet<String>> {
        let keys: HashSet<String> = std::iter::once(key.to_string()).collect();
        self.discover(&keys).await.remove(key)
    }

    /// Refresh `keys` from the backend immediately
    #[inline]
    pub async fn refresh(&self, keys: &HashSet<String>) {
        self.inner.refresh(keys).await
    }
}

impl<B: RegistryBackend> RegistryInner<B> {
    async fn refresh(&self, keys: &HashSet<String>) {
        if keys.is_empty() {
            return;
        }
        let data = match self.backend.discover(keys).await {
            Ok(data) => data,
            Err(e) => {
                warn!("registry discover {:?} failed: {}", keys, e);
                return;
            }
        };
        let mut updated = Vec::new();
        for (key, values) in data {
            if self.cache.update(&key, values.into_iter().collect()) {
                updated.push(key);
            }
        }
        if !updated.is_empty() {
            info!("registry discovery updated: {:?}", updated);
        }
        debug!("registry refresh {:?}", keys);
    }

    #[inline]
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Returns false when woken up by stop
async fn sleep_or_stop(d: Duration, stop_rx: &MAsyncRx<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => true,
        _ = stop_rx.recv() => false,
    }
}

async fn register_loop<B: RegistryBackend>(inner: Arc<RegistryInner<B>>, stop_rx: MAsyncRx<()>) {
    while !inner.is_stopped() {
        let entries: Vec<RegistryEntry> = inner.registered.read().iter().cloned().collect();
        if !entries.is_empty() {
            match inner.backend.register(&entries).await {
                Ok(_) => debug!("registry republish {} entries", entries.len()),
                Err(e) => warn!("registry republish failed: {}", e),
            }
        }
        if !sleep_or_stop(inner.config.register_interval, &stop_rx).await {
            break;
        }
    }
    info!("registry republish loop exit");
}

async fn discovery_loop<B: RegistryBackend>(inner: Arc<RegistryInner<B>>, stop_rx: MAsyncRx<()>) {
    let config = &inner.config;
    while !inner.is_stopped() {
        let keys = inner.cache.keys();
        if keys.is_empty() {
            if !sleep_or_stop(config.discovery_idle_interval, &stop_rx).await {
                break;
            }
            continue;
        }
        let changed = tokio::select! {
            r = inner.backend.monitor(&keys) => r,
            _ = stop_rx.recv() => break,
        };
        match changed {
            Ok(true) => {}
            Ok(false) => {
                if !sleep_or_stop(config.monitor_backoff, &stop_rx).await {
                    break;
                }
            }
            Err(e) => {
                warn!("registry monitor failed: {}", e);
                if !sleep_or_stop(config.monitor_backoff, &stop_rx).await {
                    break;
                }
            }
        }
        inner.refresh(&keys).await;
    }
    info!("registry discovery loop exit");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts the calls, for checking what reaches the backend
    #[derive(Default, Clone)]
    struct CountingBackend {
        mem: MemoryBackend,
        calls: Arc<AtomicUsize>,
    }

    impl RegistryBackend for CountingBackend {
        async fn register(&self, entries: &[RegistryEntry]) -> Result<bool, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.mem.register(entries).await
        }

        async fn remove(&self, entries: &[RegistryEntry]) -> Result<bool, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.mem.remove(entries).await
        }

        async fn discover(&self, keys: &HashSet<String>) -> Result<HashMap<String, Vec<String>>, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.mem.discover(keys).await
        }

        async fn monitor(&self, keys: &HashSet<String>) -> Result<bool, RegistryError> {
            self.mem.monitor(keys).await
        }
    }

    fn quick_config() -> RegistryConfig {
        RegistryConfig {
            register_interval: Duration::from_millis(100),
            discovery_idle_interval: Duration::from_millis(50),
            monitor_backoff: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_validation_no_backend_call() {
        let backend = CountingBackend::default();
        let client = RegistryClient::new(backend.clone(), RegistryConfig::default());
        let bad = vec![RegistryEntry::new("demo.Echo", "10.0.0.1:80"), RegistryEntry::new("abc", "10.0.0.1:80")];
        assert!(matches!(client.register(&bad).await, Err(RegistryError::Validation(_))));
        assert!(matches!(client.remove(&bad).await, Err(RegistryError::Validation(_))));
        assert!(matches!(client.register(&[]).await, Err(RegistryError::Validation(_))));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert!(client.registered().is_empty());
    }

    #[tokio::test]
    async fn test_register_then_discover() {
        let backend = CountingBackend::default();
        let client = RegistryClient::new(backend.clone(), RegistryConfig::default());
        let entries = vec![RegistryEntry::new("demo.Echo", "10.0.0.2:80"), RegistryEntry::new("demo.Echo", "10.0.0.1:80")];
        assert_eq!(client.register(&entries).await, Ok(true));
        let values: Vec<String> = client.discover_one("demo.Echo").await.expect("found").into_iter().collect();
        assert_eq!(values, vec!["10.0.0.1:80".to_string(), "10.0.0.2:80".to_string()]);
        let calls = backend.calls.load(Ordering::SeqCst);
        // served from the cache
        client.discover_one("demo.Echo").await.expect("found");
        assert_eq!(backend.calls.load(Ordering::SeqCst), calls);
        assert!(client.discover(&HashSet::new()).await.is_empty());

        assert_eq!(client.remove(&entries[..1]).await, Ok(true));
        assert_eq!(client.registered(), vec![RegistryEntry::new("demo.Echo", "10.0.0.1:80")]);
    }

    #[tokio::test]
    async fn test_backend_failure_is_not_surfaced() {
        let backend = MemoryBackend::default();
        backend.set_offline(true);
        let client = RegistryClient::new(backend.clone(), quick_config());
        let entries = vec![RegistryEntry::new("demo.Echo", "10.0.0.1:80")];
        assert_eq!(client.register(&entries).await, Ok(true));
        assert!(client.discover_one("demo.Echo").await.is_none());
        // republished once the backend is back
        client.start().await;
        backend.set_offline(false);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(backend.get("demo.Echo").len(), 1);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_discovery_loop_follows_change() {
        let backend = MemoryBackend::new(Duration::from_secs(10));
        let client = RegistryClient::new(backend.clone(), quick_config());
        client.start().await;
        assert_eq!(client.discover_one("demo.Echo").await, Some(BTreeSet::new()));
        backend.register(&[RegistryEntry::new("demo.Echo", "10.0.0.1:80")]).await.expect("register");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.cache().get("demo.Echo").map(|s| s.len()), Some(1));
        // stop interrupts the monitor wait promptly
        let start = std::time::Instant::now();
        client.stop().await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!client.is_running());
        client.stop().await;
    }
}
