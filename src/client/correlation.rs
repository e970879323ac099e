//! Matching in-flight requests with their responses.
//!
//! A [PendingRequest] is created (CREATED) when a non-oneway request is sent, and leaves the table
//! in exactly one of three ways:
//!
//! - RESOLVED: a response with the same `seq` arrives, see [CorrelationTable::resolve()]
//! - TIMED_OUT: the deadline is reached, by the caller or by [CorrelationTable::sweep()]
//! - CONNECTION_LOST: the owning connection dies, see [CorrelationTable::fail_conn()]
//!
//! Removal from the map is the single point of ownership transfer: whoever removes the entry
//! delivers the outcome, so the delivery happens exactly once.

use crate::proto::{CallType, RpcResponse};
use crate::{RpcError, RpcIntErr};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

pub type RpcResult = Result<Vec<u8>, RpcError>;

/// The completion handler of a CALLBACK request.
///
/// It runs on the coroutine processing the network event (connection reader, timer, or the
/// sender itself), so it should not block.
pub type Callback = Box<dyn FnOnce(RpcResult) + Send + 'static>;

pub(crate) enum Notify {
    /// For SYNC and FUTURE, a single-assignment slot
    Slot(oneshot::Sender<RpcResult>),
    /// Locked so the table stays `Sync` for callbacks which are only `Send`
    Callback(Mutex<Callback>),
}

/// Terminal state of a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Resolved,
    TimedOut,
    ConnectionLost,
}

pub struct PendingRequest {
    pub call_type: CallType,
    pub conn_id: u64,
    pub created: Instant,
    pub deadline: Instant,
    noti: Notify,
}

impl PendingRequest {
    pub(crate) fn new(call_type: CallType, conn_id: u64, timeout: Duration, noti: Notify) -> Self {
        let created = Instant::now();
        Self { call_type, conn_id, created, deadline: created + timeout, noti }
    }

    pub fn with_slot(
        call_type: CallType, conn_id: u64, timeout: Duration,
    ) -> (Self, oneshot::Receiver<RpcResult>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(call_type, conn_id, timeout, Notify::Slot(tx)), rx)
    }

    pub fn with_callback(conn_id: u64, timeout: Duration, cb: Callback) -> Self {
        Self::new(CallType::Callback, conn_id, timeout, Notify::Callback(Mutex::new(cb)))
    }

    /// Deliver the outcome, consuming the entry
    pub(crate) fn done(self, res: RpcResult) {
        match self.noti {
            Notify::Slot(tx) => {
                // The receiver might have given up (dropped future)
                let _ = tx.send(res);
            }
            Notify::Callback(cb) => {
                let cb = cb.into_inner();
                if catch_unwind(AssertUnwindSafe(move || cb(res))).is_err() {
                    error!("rpc callback panic");
                }
            }
        }
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pending({}, conn={}, age={:?})", self.call_type, self.conn_id, self.created.elapsed())
    }
}

/// Shared between the send path (insert), the receive path (resolve / fail_conn),
/// and the timer (sweep).
#[derive(Default)]
pub struct CorrelationTable {
    pending: DashMap<u64, PendingRequest>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn insert(&self, seq: u64, req: PendingRequest) {
        if let Some(old) = self.pending.insert(seq, req) {
            // seq is process-unique, should not happen
            error!("duplicated seq {} in correlation table", seq);
            old.done(Err(RpcIntErr::Closed.into()));
        }
    }

    /// Remove the entry without delivering, the caller takes over the delivery.
    #[inline]
    pub fn take(&self, seq: u64) -> Option<PendingRequest> {
        self.pending.remove(&seq).map(|(_, req)| req)
    }

    /// Deliver a response to its pending request. Responses for unknown seq (timed out,
    /// or never tracked) are discarded, returns false.
    pub fn resolve(&self, resp: RpcResponse) -> bool {
        let seq = resp.seq;
        match self.take(seq) {
            Some(req) => {
                trace!("resolve seq={} {:?}", seq, req);
                req.done(resp.into_result());
                true
            }
            None => {
                debug!("discard late or unknown response seq={}", seq);
                false
            }
        }
    }

    /// Fail one request with `err`, returns false if it has already left the table.
    pub fn fail(&self, seq: u64, err: RpcIntErr) -> bool {
        match self.take(seq) {
            Some(req) => {
                req.done(Err(err.into()));
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn timeout(&self, seq: u64) -> bool {
        self.fail(seq, RpcIntErr::Timeout)
    }

    /// Fail all requests still outstanding on a connection, returns the count.
    pub fn fail_conn(&self, conn_id: u64, err: RpcIntErr) -> usize {
        let seqs: Vec<u64> = self
            .pending
            .iter()
            .filter(|item| item.value().conn_id == conn_id)
            .map(|item| *item.key())
            .collect();
        let mut count = 0;
        for seq in seqs {
            if self.fail(seq, err) {
                count += 1;
            }
        }
        count
    }

    /// Time out every request whose deadline is before `now`, returns the count.
    pub fn sweep(&self, now: Instant) -> usize {
        let seqs: Vec<u64> = self
            .pending
            .iter()
            .filter(|item| item.value().deadline <= now)
            .map(|item| *item.key())
            .collect();
        let mut count = 0;
        for seq in seqs {
            if self.timeout(seq) {
                count += 1;
            }
        }
        count
    }

    #[inline]
    pub fn contains(&self, seq: u64) -> bool {
        self.pending.contains_key(&seq)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_cb(counter: &Arc<AtomicUsize>, last: &Arc<parking_lot::Mutex<Option<RpcResult>>>) -> Callback {
        let counter = counter.clone();
        let last = last.clone();
        Box::new(move |res| {
            counter.fetch_add(1, Ordering::SeqCst);
            last.lock().replace(res);
        })
    }

    #[test]
    fn test_resolve_slot() {
        let table = CorrelationTable::new();
        let (req, mut rx) = PendingRequest::with_slot(CallType::Sync, 1, Duration::from_secs(5));
        table.insert(11, req);
        assert!(table.contains(11));
        assert!(table.resolve(RpcResponse::ok(11, vec![42])));
        assert!(table.is_empty());
        assert_eq!(rx.try_recv().expect("resolved"), Ok(vec![42]));
        // Late duplicate is discarded
        assert!(!table.resolve(RpcResponse::ok(11, vec![43])));
    }

    #[test]
    fn test_callback_once_with_invocation_error() {
        let table = CorrelationTable::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(parking_lot::Mutex::new(None));
        table.insert(21, PendingRequest::with_callback(1, Duration::from_secs(5), counting_cb(&counter, &last)));
        assert!(table.resolve(RpcResponse::err(21, "divide by zero")));
        assert!(!table.timeout(21));
        assert_eq!(table.fail_conn(1, RpcIntErr::ConnLost), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(*last.lock(), Some(Err(RpcError::Invocation("divide by zero".to_string()))));
    }

    #[test]
    fn test_fail_conn_only_matching() {
        let table = CorrelationTable::new();
        let (a, mut rx_a) = PendingRequest::with_slot(CallType::Future, 1, Duration::from_secs(5));
        let (b, mut rx_b) = PendingRequest::with_slot(CallType::Sync, 1, Duration::from_secs(5));
        let (c, mut rx_c) = PendingRequest::with_slot(CallType::Sync, 2, Duration::from_secs(5));
        table.insert(31, a);
        table.insert(32, b);
        table.insert(33, c);
        assert_eq!(table.fail_conn(1, RpcIntErr::ConnLost), 2);
        assert_eq!(rx_a.try_recv().expect("failed"), Err(RpcIntErr::ConnLost.into()));
        assert_eq!(rx_b.try_recv().expect("failed"), Err(RpcIntErr::ConnLost.into()));
        assert!(rx_c.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_sweep_expired() {
        let table = CorrelationTable::new();
        let (short, mut rx_short) = PendingRequest::with_slot(CallType::Sync, 1, Duration::from_millis(0));
        let (long, _rx_long) = PendingRequest::with_slot(CallType::Sync, 1, Duration::from_secs(60));
        table.insert(41, short);
        table.insert(42, long);
        assert_eq!(table.sweep(Instant::now()), 1);
        assert_eq!(rx_short.try_recv().expect("timeout"), Err(RpcIntErr::Timeout.into()));
        assert!(table.contains(42));
        // The response arriving after timeout finds nothing
        assert!(!table.resolve(RpcResponse::ok(41, vec![])));
    }

    #[test]
    fn test_table_shared_across_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CorrelationTable>();

        let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build().expect("rt");
        rt.block_on(async move {
            let table = Arc::new(CorrelationTable::new());
            let counter = Arc::new(AtomicUsize::new(0));
            let last = Arc::new(parking_lot::Mutex::new(None));
            table.insert(61, PendingRequest::with_callback(1, Duration::from_secs(5), counting_cb(&counter, &last)));
            let resolver = table.clone();
            let th = tokio::spawn(async move { resolver.resolve(RpcResponse::ok(61, vec![7])) });
            assert!(th.await.expect("join"));
            assert_eq!(counter.load(Ordering::SeqCst), 1);
            assert_eq!(*last.lock(), Some(Ok(vec![7])));
        });
    }

    #[test]
    fn test_callback_panic_contained() {
        let table = CorrelationTable::new();
        table.insert(51, PendingRequest::with_callback(1, Duration::from_secs(1), Box::new(|_| panic!("oops"))));
        assert!(table.resolve(RpcResponse::ok(51, vec![])));
        assert!(table.is_empty());
    }
}
