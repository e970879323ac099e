//! Transport implementations.
//!
//! - [tcp]: length-delimited frames over a TCP stream, multiplexed by `seq`.
//! - [http]: one HTTP/1.1 POST per request, for interoperability. The server also serves a
//!   diagnostic listing of services on `GET /services`.

use crossfire::{MAsyncRx, MAsyncTx, mpmc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub mod http;
pub mod tcp;

/// Wall-clock activity of a connection, updated by the reader and the writer
pub struct ConnActivity {
    base: Instant,
    recv_ms: AtomicU64,
    send_ms: AtomicU64,
}

impl ConnActivity {
    pub fn new() -> Self {
        Self { base: Instant::now(), recv_ms: AtomicU64::new(0), send_ms: AtomicU64::new(0) }
    }

    #[inline]
    fn now_ms(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }

    #[inline]
    pub fn touch_recv(&self) {
        self.recv_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    #[inline]
    pub fn touch_send(&self) {
        self.send_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Time since the last inbound frame (or since connected)
    #[inline]
    pub fn recv_idle(&self) -> Duration {
        Duration::from_millis(self.now_ms().saturating_sub(self.recv_ms.load(Ordering::Relaxed)))
    }

    /// Time since the last outbound frame (or since connected)
    #[inline]
    pub fn send_idle(&self) -> Duration {
        Duration::from_millis(self.now_ms().saturating_sub(self.send_ms.load(Ordering::Relaxed)))
    }
}

impl Default for ConnActivity {
    fn default() -> Self {
        Self::new()
    }
}

/// Liveness of a client connection, shared by the handle and its coroutines.
///
/// Closing drops the sender of the close channel, so every coroutine waiting on
/// [close_rx](Self::close_rx) wakes up.
pub struct ConnState {
    pub addr: String,
    pub conn_id: u64,
    pub activity: ConnActivity,
    active: AtomicBool,
    close_tx: parking_lot::Mutex<Option<MAsyncTx<()>>>,
    close_rx: MAsyncRx<()>,
}

impl ConnState {
    pub fn new(addr: &str, conn_id: u64) -> Self {
        let (close_tx, close_rx) = mpmc::bounded_async::<()>(1);
        Self {
            addr: addr.to_string(),
            conn_id,
            activity: ConnActivity::new(),
            active: AtomicBool::new(true),
            close_tx: parking_lot::Mutex::new(Some(close_tx)),
            close_rx,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    #[inline]
    pub fn close_rx(&self) -> MAsyncRx<()> {
        self.close_rx.clone()
    }

    /// Returns true for the first call
    pub fn close(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        self.close_tx.lock().take();
        if was_active {
            debug!("conn {} to {} closed", self.conn_id, self.addr);
        }
        was_active
    }
}

/// A ticker for heartbeat, which does not burst after a stall
pub(crate) fn heartbeat_ticker(interval: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let state = ConnState::new("127.0.0.1:9000", 1);
        let rx = state.close_rx();
        let th = tokio::spawn(async move { rx.recv().await.is_err() });
        assert!(state.is_active());
        assert!(state.close());
        assert!(!state.close());
        assert!(!state.is_active());
        assert!(th.await.expect("join"));
    }

    #[tokio::test]
    async fn test_activity_idle() {
        let activity = ConnActivity::new();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(activity.recv_idle() >= Duration::from_millis(20));
        activity.touch_recv();
        assert!(activity.recv_idle() < Duration::from_millis(20));
        assert!(activity.send_idle() >= Duration::from_millis(20));
    }
}
