//! The bounded worker pool running business logic for the server.
//!
//! `core_workers` coroutines are always alive, taking jobs from a bounded
//! [crossfire] queue. When the queue is full, an extra worker is spawned to run the job directly,
//! up to `max_workers`, and it exits after `worker_keep_alive` without a job. When both are
//! exhausted, the job is handed back to the submitter for rejection.

use super::{Responder, ServiceInvoker};
use crate::proto::{RpcRequest, RpcResponse};
use crate::{Codec, ServerConfig};
use crossfire::{MAsyncRx, MAsyncTx, TrySendError, mpmc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// A decoded request, along with where its response goes
pub struct Job {
    pub req: RpcRequest,
    pub responder: Responder,
}

struct PoolInner<I: ServiceInvoker, C: Codec> {
    invoker: Arc<I>,
    codec: Arc<C>,
    max_workers: usize,
    keep_alive: Duration,
    tx: MAsyncTx<Job>,
    rx: MAsyncRx<Job>,
    workers: AtomicUsize,
    in_flight: AtomicUsize,
    idle: Notify,
    accepting: AtomicBool,
    // Read-locked through the hand-off of a job, so shutdown never misses a queued one
    close_tx: parking_lot::RwLock<Option<MAsyncTx<()>>>,
    close_rx: MAsyncRx<()>,
}

pub struct WorkerPool<I: ServiceInvoker, C: Codec> {
    inner: Arc<PoolInner<I, C>>,
}

impl<I: ServiceInvoker, C: Codec> WorkerPool<I, C> {
    /// Should be called within a tokio runtime, spawns the core workers.
    pub fn new(config: &ServerConfig, invoker: Arc<I>, codec: Arc<C>) -> Self {
        let core = config.core_workers.max(1);
        let (tx, rx) = mpmc::bounded_async::<Job>(config.queue_size.max(1));
        let (close_tx, close_rx) = mpmc::bounded_async::<()>(1);
        let inner = Arc::new(PoolInner {
            invoker,
            codec,
            max_workers: config.max_workers.max(core),
            keep_alive: config.worker_keep_alive,
            tx,
            rx,
            workers: AtomicUsize::new(core),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            accepting: AtomicBool::new(true),
            close_tx: parking_lot::RwLock::new(Some(close_tx)),
            close_rx,
        });
        for _ in 0..core {
            tokio::spawn(worker_loop(inner.clone(), None, None));
        }
        debug!("worker pool started with {} core workers, max {}", core, inner.max_workers);
        Self { inner }
    }

    /// Returns the job back when the pool is exhausted, or no longer accepting
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        let inner = &self.inner;
        let open = inner.close_tx.read();
        if open.is_none() || !self.is_accepting() {
            return Err(job);
        }
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let job = match inner.tx.try_send(job) {
            Ok(_) => return Ok(()),
            Err(TrySendError::Full(job)) => job,
            Err(TrySendError::Disconnected(job)) => {
                inner.job_done();
                return Err(job);
            }
        };
        if self.reserve_worker() {
            trace!("queue full, spawn extra worker");
            tokio::spawn(worker_loop(inner.clone(), Some(job), Some(inner.keep_alive)));
            return Ok(());
        }
        inner.job_done();
        Err(job)
    }

    fn reserve_worker(&self) -> bool {
        let workers = &self.inner.workers;
        let mut cur = workers.load(Ordering::Acquire);
        loop {
            if cur >= self.inner.max_workers {
                return false;
            }
            match workers.compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(v) => cur = v,
            }
        }
    }

    #[inline]
    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Reject further jobs, the ones accepted keep running
    pub fn stop_accepting(&self) {
        self.inner.accepting.store(false, Ordering::Release);
    }

    /// Number of live workers, core ones included
    #[inline]
    pub fn workers(&self) -> usize {
        self.inner.workers.load(Ordering::Acquire)
    }

    /// Jobs accepted but not yet responded
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until there are no in-flight jobs, returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }

    /// Stop all workers, jobs still queued are dropped along with their responders.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::Release);
        if inner.close_tx.write().take().is_none() {
            return;
        }
        debug!("worker pool shutdown");
        let mut dropped = 0;
        while let Ok(job) = inner.rx.try_recv() {
            drop(job);
            inner.job_done();
            dropped += 1;
        }
        if dropped > 0 {
            warn!("{} queued requests dropped on shutdown", dropped);
        }
    }
}

impl<I: ServiceInvoker, C: Codec> Drop for WorkerPool<I, C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<I: ServiceInvoker, C: Codec> PoolInner<I, C> {
    #[inline]
    fn job_done(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn run(&self, job: Job) {
        let Job { req, responder } = job;
        let seq = req.seq;
        // The invoker may panic before returning its future
        let call = async { self.invoker.invoke(&req).await };
        let resp = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(result)) => RpcResponse::ok(seq, result),
            Ok(Err(e)) => {
                debug!("{:?} failed: {}", req, e);
                RpcResponse::err(seq, e)
            }
            Err(_) => {
                error!("{:?} panicked", req);
                RpcResponse::err(seq, format!("{}.{} panicked", req.service, req.method))
            }
        };
        responder.respond(self.codec.as_ref(), resp).await;
        self.job_done();
    }
}

/// `keep_alive` is None for core workers
async fn worker_loop<I: ServiceInvoker, C: Codec>(
    inner: Arc<PoolInner<I, C>>, first: Option<Job>, keep_alive: Option<Duration>,
) {
    if let Some(job) = first {
        inner.run(job).await;
    }
    loop {
        let r = match keep_alive {
            None => tokio::select! {
                r = inner.rx.recv() => r,
                _ = inner.close_rx.recv() => break,
            },
            Some(d) => tokio::select! {
                r = tokio::time::timeout(d, inner.rx.recv()) => match r {
                    Ok(r) => r,
                    Err(_) => {
                        trace!("extra worker idle for {:?}, exit", d);
                        break;
                    }
                },
                _ = inner.close_rx.recv() => break,
            },
        };
        match r {
            Ok(job) => inner.run(job).await,
            Err(_) => break,
        }
    }
    inner.workers.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgpCodec;
    use std::future::Future;
    use tokio::sync::oneshot;

    struct Sleeper;

    impl ServiceInvoker for Sleeper {
        async fn invoke(&self, req: &RpcRequest) -> Result<Vec<u8>, String> {
            match req.method.as_str() {
                "sleep" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(vec![1])
                }
                "panic" => panic!("in service"),
                _ => Err("unknown".to_string()),
            }
        }

        fn services(&self) -> Vec<(String, String)> {
            vec![]
        }
    }

    /// Panics while building the future, not while polling it
    struct Eager;

    impl ServiceInvoker for Eager {
        fn invoke(&self, req: &RpcRequest) -> impl Future<Output = Result<Vec<u8>, String>> + Send {
            if req.method == "boom" {
                panic!("before the future");
            }
            let method = req.method.clone();
            async move { Ok(method.into_bytes()) }
        }

        fn services(&self) -> Vec<(String, String)> {
            vec![]
        }
    }

    fn job(method: &str) -> (Job, oneshot::Receiver<RpcResponse>) {
        let (tx, rx) = oneshot::channel();
        (Job { req: RpcRequest::new("svc", method, vec![]), responder: Responder::Reply(tx) }, rx)
    }

    fn config(core: usize, max: usize, queue: usize) -> ServerConfig {
        ServerConfig {
            core_workers: core,
            max_workers: max,
            queue_size: queue,
            worker_keep_alive: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_reject_when_exhausted() {
        let pool = WorkerPool::new(&config(1, 2, 1), Arc::new(Sleeper), Arc::new(MsgpCodec::default()));
        let mut rxs = Vec::new();
        // one taken by the core worker
        let (j, rx) = job("sleep");
        assert!(pool.submit(j).is_ok());
        rxs.push(rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // queued
        let (j, rx) = job("sleep");
        assert!(pool.submit(j).is_ok());
        rxs.push(rx);
        // run by an extra worker
        let (j, rx) = job("sleep");
        assert!(pool.submit(j).is_ok());
        rxs.push(rx);
        assert_eq!(pool.workers(), 2);
        let (j, _rx) = job("sleep");
        let rejected = pool.submit(j).expect_err("exhausted");
        assert_eq!(rejected.req.method, "sleep");
        assert_eq!(pool.in_flight(), 3);
        for rx in rxs {
            assert_eq!(rx.await.expect("resp").result, Some(vec![1]));
        }
        assert!(pool.drain(Duration::from_secs(1)).await);
        // the extra worker retires after keep alive
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.workers(), 1);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_pool_error_and_panic() {
        let pool = WorkerPool::new(&config(2, 2, 8), Arc::new(Sleeper), Arc::new(MsgpCodec::default()));
        let (j, rx) = job("nothing");
        let seq = j.req.seq;
        assert!(pool.submit(j).is_ok());
        let resp = rx.await.expect("resp");
        assert_eq!(resp.seq, seq);
        assert_eq!(resp.error.as_deref(), Some("unknown"));

        let (j, rx) = job("panic");
        assert!(pool.submit(j).is_ok());
        let resp = rx.await.expect("resp");
        assert_eq!(resp.error.as_deref(), Some("svc.panic panicked"));
        // the worker survives
        let (j, rx) = job("sleep");
        assert!(pool.submit(j).is_ok());
        assert!(rx.await.expect("resp").error.is_none());
        assert!(pool.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_pool_eager_panic() {
        let pool = WorkerPool::new(&config(1, 1, 8), Arc::new(Eager), Arc::new(MsgpCodec::default()));
        let (j, rx) = job("boom");
        assert!(pool.submit(j).is_ok());
        let resp = rx.await.expect("resp");
        assert_eq!(resp.error.as_deref(), Some("svc.boom panicked"));
        assert!(pool.drain(Duration::from_secs(1)).await);
        assert_eq!(pool.workers(), 1);
        // the only worker is still serving
        let (j, rx) = job("echo");
        assert!(pool.submit(j).is_ok());
        assert_eq!(rx.await.expect("resp").result, Some(b"echo".to_vec()));
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_pool_reject_after_shutdown() {
        let pool = WorkerPool::new(&config(1, 1, 8), Arc::new(Sleeper), Arc::new(MsgpCodec::default()));
        let (running, running_rx) = job("sleep");
        assert!(pool.submit(running).is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (queued, queued_rx) = job("sleep");
        assert!(pool.submit(queued).is_ok());
        assert_eq!(pool.in_flight(), 2);

        pool.shutdown();
        assert!(!pool.is_accepting());
        // the queued responder is released instead of waiting forever
        assert!(queued_rx.await.is_err());
        let (late, _late_rx) = job("sleep");
        assert_eq!(pool.submit(late).expect_err("shut down").req.method, "sleep");
        // the running one still completes
        assert_eq!(running_rx.await.expect("resp").result, Some(vec![1]));
        assert!(pool.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_pool_stop_accepting() {
        let pool = WorkerPool::new(&config(1, 1, 8), Arc::new(Sleeper), Arc::new(MsgpCodec::default()));
        pool.stop_accepting();
        let (j, _rx) = job("sleep");
        assert!(pool.submit(j).is_err());
        assert_eq!(pool.in_flight(), 0);
        pool.shutdown();
    }
}
