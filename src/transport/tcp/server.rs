use crate::Codec;
use crate::proto::{RpcRequest, read_frame, write_frame};
use crate::server::{Responder, ServerCtx, ServerTransport, ServiceInvoker};
use captains_log::filter::LogFilter;
use crossfire::{AsyncRx, MAsyncRx, mpsc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::{fmt, io, time::Duration};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

/// Capacity of the response queue of a connection
const RESP_QUEUE_SIZE: usize = 1024;

/// Accepts framed TCP connections.
///
/// Per connection, the reader decodes requests and answers pings in place, while a writer
/// coroutine serializes responses coming from the workers. A connection without any inbound frame
/// for [idle_timeout](crate::ServerConfig::idle_timeout) is closed.
pub struct TcpServer {
    listener: TcpListener,
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tcp server {:?}", self.listener.local_addr())
    }
}

impl ServerTransport for TcpServer {
    async fn bind(addr: &str) -> io::Result<Self> {
        Ok(Self { listener: TcpListener::bind(addr).await? })
    }

    #[inline]
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    async fn serve<I: ServiceInvoker, C: Codec>(self, ctx: Arc<ServerCtx<I, C>>, close_rx: MAsyncRx<()>) {
        loop {
            tokio::select! {
                r = self.listener.accept() => match r {
                    Ok((stream, peer)) => {
                        debug!("accept conn from {}", peer);
                        tokio::spawn(serve_conn(stream, peer, ctx.clone()));
                    }
                    Err(e) => {
                        warn!("accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = close_rx.recv() => break,
            }
        }
        info!("{:?} exit", self);
    }
}

async fn serve_conn<I: ServiceInvoker, C: Codec>(stream: TcpStream, peer: SocketAddr, ctx: Arc<ServerCtx<I, C>>) {
    let logger = ctx.logger.clone();
    if let Err(e) = stream.set_nodelay(true) {
        logger_warn!(logger, "set_nodelay for {} failed: {}", peer, e);
    }
    let (mut reader, writer) = stream.into_split();
    let (resp_tx, resp_rx) = mpsc::bounded_async::<Vec<u8>>(RESP_QUEUE_SIZE);
    let close_rx = ctx.conn_close_rx();
    let writer_th =
        tokio::spawn(write_loop(writer, resp_rx, close_rx.clone(), peer, ctx.config.write_timeout, logger.clone()));
    let idle_timeout = ctx.config.idle_timeout();
    let mut buf = Vec::with_capacity(1024);
    loop {
        let r = tokio::select! {
            r = tokio::time::timeout(idle_timeout, read_frame(&mut reader, &mut buf, ctx.config.max_frame_size)) => r,
            _ = close_rx.recv() => break,
        };
        match r {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                logger_debug!(logger, "conn from {} closed by peer", peer);
                break;
            }
            Ok(Err(e)) => {
                logger_warn!(logger, "conn from {} read error: {}", peer, e);
                break;
            }
            Err(_) => {
                logger_info!(logger, "conn from {} idle for {:?}, close", peer, idle_timeout);
                break;
            }
        }
        let req: RpcRequest = match ctx.codec.decode(&buf) {
            Ok(req) => req,
            Err(_) => {
                logger_warn!(logger, "conn from {} protocol error: undecodable request", peer);
                break;
            }
        };
        if req.is_ping() {
            logger_trace!(logger, "conn from {} recv ping", peer);
            match ctx.pong_frame() {
                Ok(frame) => {
                    if resp_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    logger_warn!(logger, "encode pong error: {}", e);
                }
            }
            continue;
        }
        ctx.handle_req(req, Responder::Stream(resp_tx.clone())).await;
    }
    drop(reader);
    // The writer exits after responses of in-flight requests are written
    drop(resp_tx);
    let _ = writer_th.await;
    logger_debug!(logger, "conn from {} exit", peer);
}

async fn write_loop(
    mut writer: OwnedWriteHalf, resp_rx: AsyncRx<Vec<u8>>, close_rx: MAsyncRx<()>, peer: SocketAddr,
    write_timeout: Duration, logger: Arc<LogFilter>,
) {
    loop {
        // Responses queued before close are still written
        let frame = tokio::select! {
            biased;
            r = resp_rx.recv() => match r {
                Ok(frame) => frame,
                Err(_) => break,
            },
            _ = close_rx.recv() => break,
        };
        match tokio::time::timeout(write_timeout, write_frame(&mut writer, &frame)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                logger_warn!(logger, "conn from {} write error: {}", peer, e);
                break;
            }
            Err(_) => {
                logger_warn!(logger, "conn from {} write timeout", peer);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}
