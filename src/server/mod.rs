//! This module contains traits defined for the server-side
//!
//! [RpcServer] owns a [ServerCtx] shared by all listeners and connections. A transport reads and
//! decodes requests, then calls [ServerCtx::handle_req()], which submits them to the
//! [WorkerPool](dispatch::WorkerPool). The worker sends the response back through the
//! [Responder] of the request.

use crate::proto::{RpcRequest, RpcResponse, encode_frame};
use crate::registry::{RegistryBackend, RegistryClient, RegistryEntry};
use crate::{Codec, RegistryError, RpcIntErr, ServerConfig};
use captains_log::filter::LogFilter;
use crossfire::{MAsyncRx, MAsyncTx, mpmc};
use std::net::SocketAddr;
use std::{fmt, future::Future, io, sync::Arc};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

pub mod dispatch;
use dispatch::{Job, WorkerPool};

mod service;
pub use service::*;

/// This trait is for server-side transport layer protocol.
///
/// The implementation can be found on:
///
/// - [TcpServer](crate::transport::tcp::TcpServer): framed TCP stream
/// - [HttpServer](crate::transport::http::HttpServer): HTTP/1.1 POST
pub trait ServerTransport: Send + Sized + 'static + fmt::Debug {
    fn bind(addr: &str) -> impl Future<Output = io::Result<Self>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// The accept loop. Returns when `close_rx` is closed, connections are left to
    /// [ServerCtx::conn_close_rx()].
    fn serve<I: ServiceInvoker, C: Codec>(
        self, ctx: Arc<ServerCtx<I, C>>, close_rx: MAsyncRx<()>,
    ) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Init,
    Running,
    Stopped,
}

/// Where the response of a request goes
pub enum Responder {
    /// Encoded into a frame, for the writer of a stream connection
    Stream(MAsyncTx<Vec<u8>>),
    /// Handed to the request handler which replies with it
    Reply(oneshot::Sender<RpcResponse>),
}

impl Responder {
    pub async fn respond<C: Codec>(self, codec: &C, resp: RpcResponse) {
        match self {
            Self::Stream(tx) => match encode_frame(codec, &resp) {
                Ok(frame) => {
                    if tx.send(frame).await.is_err() {
                        debug!("{:?} dropped, connection closed", resp);
                    }
                }
                Err(e) => warn!("encode {:?} error: {}", resp, e),
            },
            Self::Reply(tx) => {
                if tx.send(resp).is_err() {
                    debug!("response dropped, request handler gone");
                }
            }
        }
    }
}

/// Shared by listeners and connections of a [RpcServer]
pub struct ServerCtx<I: ServiceInvoker, C: Codec> {
    /// Level filter for the logs of connections and requests, adjustable at runtime
    pub logger: Arc<LogFilter>,
    pub config: ServerConfig,
    pub codec: Arc<C>,
    pub invoker: Arc<I>,
    pool: WorkerPool<I, C>,
    conn_close_rx: MAsyncRx<()>,
}

impl<I: ServiceInvoker, C: Codec> ServerCtx<I, C> {
    #[inline]
    pub fn pool(&self) -> &WorkerPool<I, C> {
        &self.pool
    }

    /// Closed when the server stops, after in-flight requests drained
    #[inline]
    pub fn conn_close_rx(&self) -> MAsyncRx<()> {
        self.conn_close_rx.clone()
    }

    #[inline]
    pub fn pong_frame(&self) -> Result<Vec<u8>, RpcIntErr> {
        encode_frame(self.codec.as_ref(), &RpcResponse::pong())
    }

    /// Check the access token, then hand the request to the worker pool.
    ///
    /// Never fails the connection, rejected requests are answered with an error response.
    pub async fn handle_req(&self, req: RpcRequest, responder: Responder) {
        if let Some(token) = self.config.access_token.as_ref() {
            if req.access_token.as_ref() != Some(token) {
                logger_warn!(self.logger, "{:?} rejected: access token mismatch", req);
                let resp = RpcResponse::err(req.seq, "access token mismatch");
                responder.respond(self.codec.as_ref(), resp).await;
                return;
            }
        }
        logger_trace!(self.logger, "recv {:?}", req);
        if let Err(job) = self.pool.submit(Job { req, responder }) {
            let msg = if self.pool.is_accepting() {
                "server busy, worker pool exhausted"
            } else {
                "server closed"
            };
            logger_warn!(self.logger, "{:?} rejected: {}", job.req, msg);
            let resp = RpcResponse::err(job.req.seq, msg);
            job.responder.respond(self.codec.as_ref(), resp).await;
        }
    }
}

/// The server hosting a [ServiceInvoker], on one or more listeners.
///
/// Should be created within a tokio runtime, since it spawns the workers.
pub struct RpcServer<I: ServiceInvoker, C: Codec> {
    ctx: Arc<ServerCtx<I, C>>,
    status_tx: watch::Sender<ServerStatus>,
    listeners: parking_lot::Mutex<Vec<(MAsyncTx<()>, JoinHandle<()>)>>,
    conn_close_tx: parking_lot::Mutex<Option<MAsyncTx<()>>>,
}

impl<I: ServiceInvoker, C: Codec> RpcServer<I, C> {
    pub fn new(config: ServerConfig, invoker: Arc<I>) -> Self {
        let codec = Arc::new(C::default());
        let pool = WorkerPool::new(&config, invoker.clone(), codec.clone());
        let (conn_close_tx, conn_close_rx) = mpmc::bounded_async::<()>(1);
        let logger = Arc::new(LogFilter::new());
        let ctx = ServerCtx { logger, config, codec, invoker, pool, conn_close_rx };
        let (status_tx, _) = watch::channel(ServerStatus::Init);
        Self {
            ctx: Arc::new(ctx),
            status_tx,
            listeners: parking_lot::Mutex::new(Vec::new()),
            conn_close_tx: parking_lot::Mutex::new(Some(conn_close_tx)),
        }
    }

    #[inline]
    pub fn ctx(&self) -> &Arc<ServerCtx<I, C>> {
        &self.ctx
    }

    /// Adjust the log level of connections and requests, without touching the global logger
    #[inline]
    pub fn set_log_level(&self, level: log::Level) {
        self.ctx.logger.set_level(level);
    }

    /// Bind `addr` and spawn the accept loop, returns the actual local address
    pub async fn listen<T: ServerTransport>(&self, addr: &str) -> io::Result<String> {
        if self.status() == ServerStatus::Stopped {
            return Err(io::Error::other("server stopped"));
        }
        let listener = T::bind(addr).await?;
        let local_addr = listener.local_addr()?.to_string();
        let (close_tx, close_rx) = mpmc::bounded_async::<()>(1);
        let th = tokio::spawn(listener.serve(self.ctx.clone(), close_rx));
        self.listeners.lock().push((close_tx, th));
        self.status_tx.send_replace(ServerStatus::Running);
        info!("listening on {}", local_addr);
        Ok(local_addr)
    }

    #[inline]
    pub fn status(&self) -> ServerStatus {
        *self.status_tx.borrow()
    }

    /// Watch the status change
    #[inline]
    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.status_tx.subscribe()
    }

    /// Stop accepting, wait for in-flight requests within `server_close_wait`, then close the
    /// connections.
    pub async fn stop(&self) {
        if self.status() == ServerStatus::Stopped {
            return;
        }
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for (close_tx, th) in listeners {
            drop(close_tx);
            let _ = th.await;
        }
        self.status_tx.send_replace(ServerStatus::Stopped);
        let pool = self.ctx.pool();
        pool.stop_accepting();
        let wait = self.ctx.config.server_close_wait;
        if !pool.drain(wait).await {
            warn!("{} requests still running after {:?}", pool.in_flight(), wait);
        }
        self.conn_close_tx.lock().take();
        pool.shutdown();
        info!("server stopped");
    }

    /// Register every service of the invoker at `address`
    pub async fn publish<B: RegistryBackend>(
        &self, registry: &RegistryClient<B>, address: &str,
    ) -> Result<bool, RegistryError> {
        registry.register(&self.entries(address)).await
    }

    pub async fn unpublish<B: RegistryBackend>(
        &self, registry: &RegistryClient<B>, address: &str,
    ) -> Result<bool, RegistryError> {
        registry.remove(&self.entries(address)).await
    }

    fn entries(&self, address: &str) -> Vec<RegistryEntry> {
        self.ctx.invoker.services().into_iter().map(|(key, _)| RegistryEntry::new(key, address)).collect()
    }
}
