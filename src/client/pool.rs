use super::{ClientTransport, ResponseSink};
use crate::{ClientConfig, RpcIntErr};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

static CONN_ID: AtomicU64 = AtomicU64::new(1);

type Slot<T> = Arc<Mutex<Option<Arc<T>>>>;

/// Keeps exactly one active connection per address.
///
/// A slot is locked only by connecting to its own address. An inactive connection found in the
/// slot is closed and replaced.
pub struct ConnPool<T: ClientTransport> {
    slots: DashMap<String, Slot<T>>,
}

impl<T: ClientTransport> Default for ConnPool<T> {
    fn default() -> Self {
        Self { slots: DashMap::new() }
    }
}

impl<T: ClientTransport> ConnPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Obtain the active connection to `addr`, or establish a new one.
    pub async fn get_or_connect<F>(
        &self, addr: &str, config: &ClientConfig, new_sink: F,
    ) -> Result<Arc<T>, RpcIntErr>
    where
        F: FnOnce(u64) -> ResponseSink,
    {
        let slot: Slot<T> = self.slots.entry(addr.to_string()).or_default().clone();
        let mut guard = slot.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.is_active() {
                return Ok(conn.clone());
            }
            debug!("replace inactive conn {} to {}", conn.conn_id(), addr);
            conn.close();
            guard.take();
        }
        let conn_id = CONN_ID.fetch_add(1, Ordering::Relaxed);
        let sink = new_sink(conn_id);
        let conn = match tokio::time::timeout(config.connect_timeout, T::connect(addr, conn_id, config, sink))
            .await
        {
            Ok(Ok(conn)) => Arc::new(conn),
            Ok(Err(e)) => {
                warn!("connect to {} failed: {}", addr, e);
                return Err(e);
            }
            Err(_) => {
                warn!("connect to {} timeout after {:?}", addr, config.connect_timeout);
                return Err(RpcIntErr::Unreachable);
            }
        };
        debug!("connected to {}, conn {}", addr, conn_id);
        guard.replace(conn.clone());
        Ok(conn)
    }

    /// The pooled connection to `addr` if it is active
    pub fn get(&self, addr: &str) -> Option<Arc<T>> {
        let slot = self.slots.get(addr)?.clone();
        let guard = slot.try_lock().ok()?;
        guard.as_ref().filter(|conn| conn.is_active()).cloned()
    }

    /// Close and forget the connection to `addr`
    pub async fn remove(&self, addr: &str) {
        if let Some((_, slot)) = self.slots.remove(addr) {
            if let Some(conn) = slot.lock().await.take() {
                conn.close();
            }
        }
    }

    pub async fn close_all(&self) {
        let addrs: Vec<String> = self.slots.iter().map(|item| item.key().clone()).collect();
        for addr in addrs {
            self.remove(&addr).await;
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
