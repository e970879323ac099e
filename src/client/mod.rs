//! This module contains traits and the call dispatcher for the client-side
//!
//! [RpcClient] obtains a connection from the [ConnPool](pool::ConnPool) for the target address,
//! registers the request in the [CorrelationTable](correlation::CorrelationTable) according to its
//! [CallType], and hands the frame to the connection writer. The connection reader feeds
//! responses to a [ResponseSink], which resolves the table.

use crate::proto::{CallType, PING_SEQ, RpcRequest, RpcResponse, encode_frame, next_seq};
use crate::{ClientConfig, Codec, RpcError, RpcIntErr};
use crossfire::{MAsyncTx, mpmc};
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use std::{fmt, future::Future};

pub mod correlation;
use correlation::{Callback, CorrelationTable, PendingRequest, RpcResult};

mod future;
pub use future::RpcFuture;

pub mod pool;
use pool::ConnPool;

mod timer;

/// This trait is for client-side transport layer protocol.
///
/// The implementation can be found on:
///
/// - [TcpClient](crate::transport::tcp::TcpClient): framed TCP stream
/// - [HttpClient](crate::transport::http::HttpClient): one HTTP POST per request
pub trait ClientTransport: Send + Sync + Sized + 'static + fmt::Debug {
    /// Establish a connection, and spawn its receive path which reports to `sink`.
    ///
    /// The implementation is expected to call [ResponseSink::on_lost()] once when the connection
    /// dies, and to keep it alive with heartbeat.
    fn connect(
        addr: &str, conn_id: u64, config: &ClientConfig, sink: ResponseSink,
    ) -> impl Future<Output = Result<Self, RpcIntErr>> + Send;

    fn conn_id(&self) -> u64;

    fn addr(&self) -> &str;

    fn is_active(&self) -> bool;

    /// Hand an encoded frame to the write path, and return without waiting for the response.
    /// Only guarantees local hand-off.
    fn send(&self, seq: u64, frame: Vec<u8>) -> impl Future<Output = Result<(), RpcIntErr>> + Send;

    fn close(&self);
}

type DecodeFn = dyn Fn(&[u8]) -> Result<RpcResponse, RpcIntErr> + Send + Sync;

/// The receive path of a connection, bound to the correlation table of the client.
#[derive(Clone)]
pub struct ResponseSink {
    conn_id: u64,
    table: Arc<CorrelationTable>,
    decode: Arc<DecodeFn>,
    ping: Result<Arc<Vec<u8>>, RpcIntErr>,
}

impl ResponseSink {
    pub fn new<C: Codec>(conn_id: u64, table: Arc<CorrelationTable>, codec: Arc<C>) -> Self {
        let codec_ping = codec.clone();
        let decode = Arc::new(move |buf: &[u8]| -> Result<RpcResponse, RpcIntErr> {
            codec.decode::<RpcResponse>(buf).map_err(|_| RpcIntErr::Decode)
        });
        let ping = encode_frame(codec_ping.as_ref(), &RpcRequest::ping()).map(Arc::new);
        Self { conn_id, table, decode, ping }
    }

    /// The encoded ping frame (with header), for the heartbeat of the transport
    #[inline]
    pub fn ping_frame(&self) -> Result<Vec<u8>, RpcIntErr> {
        self.ping.as_ref().map(|frame| frame.as_ref().clone()).map_err(|e| *e)
    }

    #[inline]
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Process the body of an inbound frame. Returns error when the frame is not decodable,
    /// the connection should be closed as the stream is out of sync.
    pub fn on_frame(&self, buf: &[u8]) -> Result<(), RpcIntErr> {
        let resp = (self.decode)(buf)?;
        if resp.is_pong() {
            trace!("conn {} recv pong", self.conn_id);
            return Ok(());
        }
        self.table.resolve(resp);
        Ok(())
    }

    /// Fail a single request, when the transport knows which one is broken
    #[inline]
    pub fn fail(&self, seq: u64, err: RpcIntErr) {
        self.table.fail(seq, err);
    }

    /// All requests outstanding on this connection fail together
    pub fn on_lost(&self) -> usize {
        let count = self.table.fail_conn(self.conn_id, RpcIntErr::ConnLost);
        if count > 0 {
            warn!("conn {} lost, {} pending requests failed", self.conn_id, count);
        }
        count
    }
}

/// What the caller gets back from [RpcClient::invoke()], depending on [CallType]
pub enum CallResult {
    /// SYNC: the response payload
    Response(Vec<u8>),
    /// FUTURE: the handle to wait or poll
    Future(RpcFuture),
    /// CALLBACK: the handler will be invoked exactly once
    Registered,
    /// ONEWAY: handed off to the write path
    Sent,
}

impl fmt::Debug for CallResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Response(r) => write!(f, "Response({} bytes)", r.len()),
            Self::Future(fut) => write!(f, "Future(seq={})", fut.seq()),
            Self::Registered => write!(f, "Registered"),
            Self::Sent => write!(f, "Sent"),
        }
    }
}

struct ClientInner<T: ClientTransport, C: Codec> {
    config: ClientConfig,
    codec: Arc<C>,
    pool: ConnPool<T>,
    table: Arc<CorrelationTable>,
    closed: AtomicBool,
    // Dropped on close to stop the timer
    close_tx: parking_lot::Mutex<Option<MAsyncTx<()>>>,
}

/// The transport client and call dispatcher.
///
/// Cloning is cheap, all clones share the connection pool and the correlation table.
/// Should be created within a tokio runtime, since it spawns the timeout timer.
pub struct RpcClient<T: ClientTransport, C: Codec> {
    inner: Arc<ClientInner<T, C>>,
}

impl<T: ClientTransport, C: Codec> Clone for RpcClient<T, C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: ClientTransport, C: Codec> RpcClient<T, C> {
    pub fn new(config: ClientConfig) -> Self {
        let table = Arc::new(CorrelationTable::new());
        let (close_tx, close_rx) = mpmc::bounded_async::<()>(1);
        tokio::spawn(timer::sweep_loop(table.clone(), config.timer_interval, close_rx));
        let inner = ClientInner {
            config,
            codec: Arc::new(C::default()),
            pool: ConnPool::new(),
            table,
            closed: AtomicBool::new(false),
            close_tx: parking_lot::Mutex::new(Some(close_tx)),
        };
        Self { inner: Arc::new(inner) }
    }

    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    #[inline]
    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    #[inline]
    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.inner.table
    }

    #[inline]
    pub fn pool(&self) -> &ConnPool<T> {
        &self.inner.pool
    }

    /// Build a request with arguments encoded by our codec
    pub fn new_request<A: Serialize>(
        &self, service: &str, method: &str, args: &A,
    ) -> Result<RpcRequest, RpcError> {
        let params = self.inner.codec.encode(args).map_err(|_| RpcIntErr::Encode)?;
        Ok(RpcRequest::new(service, method, params))
    }

    #[inline]
    pub fn decode<R: DeserializeOwned>(&self, buf: &[u8]) -> Result<R, RpcError> {
        self.inner.codec.decode::<R>(buf).map_err(|_| RpcIntErr::Decode.into())
    }

    /// Establish or reuse the connection to `addr`
    pub async fn connect(&self, addr: &str) -> Result<Arc<T>, RpcError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcIntErr::Closed.into());
        }
        let table = &self.inner.table;
        let codec = &self.inner.codec;
        let conn = self
            .inner
            .pool
            .get_or_connect(addr, &self.inner.config, |conn_id| {
                ResponseSink::new(conn_id, table.clone(), codec.clone())
            })
            .await?;
        Ok(conn)
    }

    async fn prepare(&self, addr: &str, req: &mut RpcRequest) -> Result<(Arc<T>, Vec<u8>), RpcError> {
        if req.seq == PING_SEQ {
            req.seq = next_seq();
        }
        if req.access_token.is_none() {
            req.access_token = self.inner.config.access_token.clone();
        }
        let conn = self.connect(addr).await?;
        if !conn.is_active() {
            return Err(RpcIntErr::Unreachable.into());
        }
        let frame = encode_frame(self.inner.codec.as_ref(), &*req)?;
        Ok((conn, frame))
    }

    /// SYNC: wait for the outcome, bounded by `timeout`.
    ///
    /// A response arriving after the timeout is discarded.
    pub async fn call_sync(&self, addr: &str, mut req: RpcRequest, timeout: Duration) -> RpcResult {
        let (conn, frame) = self.prepare(addr, &mut req).await?;
        let seq = req.seq;
        let table = &self.inner.table;
        let (pending, mut rx) = PendingRequest::with_slot(CallType::Sync, conn.conn_id(), timeout);
        table.insert(seq, pending);
        if let Err(e) = conn.send(seq, frame).await {
            table.take(seq);
            return Err(e.into());
        }
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(res)) => res,
            Ok(Err(_)) => Err(RpcIntErr::ConnLost.into()),
            Err(_) => {
                if table.take(seq).is_some() {
                    debug!("{:?} to {} timeout after {:?}", req, addr, timeout);
                    Err(RpcIntErr::Timeout.into())
                } else {
                    // Taken by a resolver at the edge of timeout, which always delivers
                    rx.await.unwrap_or(Err(RpcIntErr::Timeout.into()))
                }
            }
        }
    }

    /// FUTURE: returns the handle once the request is handed off.
    pub async fn call_future(
        &self, addr: &str, mut req: RpcRequest, timeout: Duration,
    ) -> Result<RpcFuture, RpcError> {
        let (conn, frame) = self.prepare(addr, &mut req).await?;
        let seq = req.seq;
        let table = &self.inner.table;
        let (pending, rx) = PendingRequest::with_slot(CallType::Future, conn.conn_id(), timeout);
        table.insert(seq, pending);
        let fut = RpcFuture::new(seq, rx, table.clone());
        if let Err(e) = conn.send(seq, frame).await {
            table.fail(seq, e);
        }
        Ok(fut)
    }

    /// CALLBACK: `cb` is invoked exactly once, including when the request cannot be sent.
    pub async fn call_callback(&self, addr: &str, mut req: RpcRequest, timeout: Duration, cb: Callback) {
        let (conn, frame) = match self.prepare(addr, &mut req).await {
            Ok(r) => r,
            Err(e) => {
                PendingRequest::with_callback(0, timeout, cb).done(Err(e));
                return;
            }
        };
        let seq = req.seq;
        let table = &self.inner.table;
        table.insert(seq, PendingRequest::with_callback(conn.conn_id(), timeout, cb));
        if let Err(e) = conn.send(seq, frame).await {
            table.fail(seq, e);
        }
    }

    /// ONEWAY: no pending entry, `Ok` only means local hand-off.
    pub async fn call_oneway(&self, addr: &str, mut req: RpcRequest) -> Result<(), RpcError> {
        let (conn, frame) = self.prepare(addr, &mut req).await?;
        conn.send(req.seq, frame).await?;
        Ok(())
    }

    /// Dispatch by call type, with the default `task_timeout`.
    ///
    /// For CALLBACK without a handler, the outcome is only logged.
    pub async fn invoke(
        &self, addr: &str, req: RpcRequest, call_type: CallType, callback: Option<Callback>,
    ) -> Result<CallResult, RpcError> {
        let timeout = self.inner.config.task_timeout;
        match call_type {
            CallType::Sync => Ok(CallResult::Response(self.call_sync(addr, req, timeout).await?)),
            CallType::Future => Ok(CallResult::Future(self.call_future(addr, req, timeout).await?)),
            CallType::Callback => {
                let cb: Callback = match callback {
                    Some(cb) => cb,
                    None => {
                        let desc = format!("{:?}", req);
                        Box::new(move |res: RpcResult| match res {
                            Ok(_) => debug!("{} done", desc),
                            Err(e) => debug!("{} failed: {}", desc, e),
                        })
                    }
                };
                self.call_callback(addr, req, timeout, cb).await;
                Ok(CallResult::Registered)
            }
            CallType::Oneway => {
                self.call_oneway(addr, req).await?;
                Ok(CallResult::Sent)
            }
        }
    }

    /// Typed SYNC call
    pub async fn call<A: Serialize, R: DeserializeOwned>(
        &self, addr: &str, service: &str, method: &str, args: &A,
    ) -> Result<R, RpcError> {
        let req = self.new_request(service, method, args)?;
        let buf = self.call_sync(addr, req, self.inner.config.task_timeout).await?;
        self.decode(&buf)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close all connections, requests outstanding on them fail with connection lost.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.close_tx.lock().take();
        self.inner.pool.close_all().await;
        info!("rpc client closed");
    }
}
