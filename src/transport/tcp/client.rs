use crate::client::{ClientTransport, ResponseSink};
use crate::proto::{read_frame, write_frame};
use crate::transport::{ConnState, heartbeat_ticker};
use crate::{ClientConfig, RpcIntErr};
use crossfire::{AsyncRx, MAsyncRx, MAsyncTx, mpsc};
use std::sync::Arc;
use std::{fmt, time::Duration};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// A client connection over TCP.
///
/// One coroutine reads response frames and feeds the [ResponseSink], another one owns the
/// write half, so writes are ordered. The writer sends a ping when idle for a heartbeat
/// interval, and the reader tears the connection down when nothing arrives within
/// `heartbeat_interval * heartbeat_retry`.
pub struct TcpClient {
    state: Arc<ConnState>,
    write_tx: MAsyncTx<Vec<u8>>,
    write_timeout: Duration,
}

impl fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tcp conn {} to {}", self.state.conn_id, self.state.addr)
    }
}

impl ClientTransport for TcpClient {
    async fn connect(
        addr: &str, conn_id: u64, config: &ClientConfig, sink: ResponseSink,
    ) -> Result<Self, RpcIntErr> {
        let ping = sink.ping_frame()?;
        let stream = TcpStream::connect(addr).await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("set_nodelay to {} failed: {}", addr, e);
        }
        let (reader, writer) = stream.into_split();
        let state = Arc::new(ConnState::new(addr, conn_id));
        let (write_tx, write_rx) = mpsc::bounded_async::<Vec<u8>>(config.write_queue_size.max(1));
        tokio::spawn(write_loop(writer, write_rx, ping, state.clone(), config.clone()));
        tokio::spawn(read_loop(reader, sink, state.clone(), config.clone()));
        Ok(Self { state, write_tx, write_timeout: config.write_timeout })
    }

    #[inline]
    fn conn_id(&self) -> u64 {
        self.state.conn_id
    }

    #[inline]
    fn addr(&self) -> &str {
        &self.state.addr
    }

    #[inline]
    fn is_active(&self) -> bool {
        self.state.is_active()
    }

    async fn send(&self, _seq: u64, frame: Vec<u8>) -> Result<(), RpcIntErr> {
        if !self.state.is_active() {
            return Err(RpcIntErr::Unreachable);
        }
        // Only blocks when the write queue is full
        match tokio::time::timeout(self.write_timeout, self.write_tx.send(frame)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(RpcIntErr::ConnLost),
            Err(_) => {
                warn!("{:?} write queue full for {:?}", self, self.write_timeout);
                Err(RpcIntErr::Timeout)
            }
        }
    }

    #[inline]
    fn close(&self) {
        self.state.close();
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.state.close();
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf, write_rx: AsyncRx<Vec<u8>>, ping: Vec<u8>, state: Arc<ConnState>,
    config: ClientConfig,
) {
    let close_rx: MAsyncRx<()> = state.close_rx();
    let heartbeat = config.heartbeat_interval;
    let mut ticker = heartbeat_ticker(heartbeat);
    loop {
        let frame = tokio::select! {
            biased;
            r = write_rx.recv() => match r {
                Ok(frame) => frame,
                Err(_) => break,
            },
            _ = close_rx.recv() => break,
            _ = ticker.tick() => {
                let activity = &state.activity;
                if activity.send_idle() < heartbeat && activity.recv_idle() < heartbeat {
                    continue;
                }
                trace!("conn {} send ping", state.conn_id);
                ping.clone()
            }
        };
        match tokio::time::timeout(config.write_timeout, write_frame(&mut writer, &frame)).await {
            Ok(Ok(_)) => state.activity.touch_send(),
            Ok(Err(e)) => {
                warn!("conn {} to {} write error: {}", state.conn_id, state.addr, e);
                break;
            }
            Err(_) => {
                warn!("conn {} to {} write timeout", state.conn_id, state.addr);
                break;
            }
        }
    }
    state.close();
    let _ = writer.shutdown().await;
    trace!("conn {} writer exit", state.conn_id);
}

async fn read_loop(mut reader: OwnedReadHalf, sink: ResponseSink, state: Arc<ConnState>, config: ClientConfig) {
    let close_rx: MAsyncRx<()> = state.close_rx();
    let dead_timeout = config.dead_timeout();
    let mut buf = Vec::with_capacity(1024);
    loop {
        let r = tokio::select! {
            r = tokio::time::timeout(dead_timeout, read_frame(&mut reader, &mut buf, config.max_frame_size)) => r,
            _ = close_rx.recv() => break,
        };
        match r {
            Ok(Ok(true)) => {
                state.activity.touch_recv();
                if let Err(e) = sink.on_frame(&buf) {
                    warn!("conn {} to {} malformed response: {}", state.conn_id, state.addr, e);
                    break;
                }
            }
            Ok(Ok(false)) => {
                debug!("conn {} to {} closed by peer", state.conn_id, state.addr);
                break;
            }
            Ok(Err(e)) => {
                warn!("conn {} to {} read error: {}", state.conn_id, state.addr, e);
                break;
            }
            Err(_) => {
                warn!("conn {} to {}: no traffic within {:?}, presumed dead", state.conn_id, state.addr, dead_timeout);
                break;
            }
        }
    }
    state.close();
    sink.on_lost();
}
