use super::CONTENT_TYPE_PAYLOAD;
use crate::client::{ClientTransport, ResponseSink};
use crate::proto::{FRAME_HEADER_LEN, PING_SEQ};
use crate::transport::{ConnState, heartbeat_ticker};
use crate::{ClientConfig, RpcIntErr};
use bytes::Bytes;
use crossfire::{AsyncRx, MAsyncRx, MAsyncTx, mpsc};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::sync::Arc;
use std::{fmt, time::Duration};
use tokio::net::TcpStream;

/// A client connection over HTTP/1.1 keep-alive.
///
/// One coroutine owns the hyper sender and issues the requests queued by [send()](Self::send)
/// in order, one exchange at a time as HTTP/1.1 allows. Each response body is fed to the
/// [ResponseSink] the same way a TCP frame is. The writer also sends a ping when idle.
pub struct HttpClient {
    state: Arc<ConnState>,
    write_tx: MAsyncTx<(u64, Bytes)>,
    write_timeout: Duration,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "http conn {} to {}", self.state.conn_id, self.state.addr)
    }
}

impl ClientTransport for HttpClient {
    async fn connect(
        addr: &str, conn_id: u64, config: &ClientConfig, sink: ResponseSink,
    ) -> Result<Self, RpcIntErr> {
        let ping = payload(sink.ping_frame()?);
        let stream = TcpStream::connect(addr).await?;
        let (sender, conn) = http1::handshake(TokioIo::new(stream)).await.map_err(|e| {
            warn!("http handshake with {} error: {}", addr, e);
            RpcIntErr::Unreachable
        })?;
        let state = Arc::new(ConnState::new(addr, conn_id));
        let driver_state = state.clone();
        let driver_sink = sink.clone();
        tokio::spawn(async move {
            let close_rx = driver_state.close_rx();
            tokio::select! {
                r = conn => {
                    if let Err(e) = r {
                        warn!("http conn {} to {} error: {}", driver_state.conn_id, driver_state.addr, e);
                    }
                }
                _ = close_rx.recv() => {}
            }
            driver_state.close();
            driver_sink.on_lost();
        });
        let (write_tx, write_rx) = mpsc::bounded_async::<(u64, Bytes)>(config.write_queue_size.max(1));
        tokio::spawn(write_loop(sender, write_rx, ping, state.clone(), sink, config.clone()));
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

    async fn send(&self, seq: u64, frame: Vec<u8>) -> Result<(), RpcIntErr> {
        if !self.state.is_active() {
            return Err(RpcIntErr::Unreachable);
        }
        match tokio::time::timeout(self.write_timeout, self.write_tx.send((seq, payload(frame)))).await {
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

impl Drop for HttpClient {
    fn drop(&mut self) {
        self.state.close();
    }
}

/// Strip the frame header, the length is carried by HTTP
#[inline]
fn payload(frame: Vec<u8>) -> Bytes {
    Bytes::from(frame).slice(FRAME_HEADER_LEN..)
}

fn new_request(host: &str, body: Bytes) -> Result<Request<Full<Bytes>>, RpcIntErr> {
    Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(HOST, host)
        .header(CONTENT_TYPE, CONTENT_TYPE_PAYLOAD)
        .body(Full::new(body))
        .map_err(|_| RpcIntErr::Encode)
}

async fn write_loop(
    mut sender: SendRequest<Full<Bytes>>, write_rx: AsyncRx<(u64, Bytes)>, ping: Bytes, state: Arc<ConnState>,
    sink: ResponseSink, config: ClientConfig,
) {
    let close_rx: MAsyncRx<()> = state.close_rx();
    let heartbeat = config.heartbeat_interval;
    let dead_timeout = config.dead_timeout();
    let mut ticker = heartbeat_ticker(heartbeat);
    loop {
        let (seq, body) = tokio::select! {
            biased;
            r = write_rx.recv() => match r {
                Ok(item) => item,
                Err(_) => break,
            },
            _ = close_rx.recv() => break,
            _ = ticker.tick() => {
                let activity = &state.activity;
                if activity.recv_idle() >= dead_timeout {
                    warn!("http conn {} to {}: no traffic within {:?}, presumed dead", state.conn_id, state.addr, dead_timeout);
                    break;
                }
                if activity.send_idle() < heartbeat && activity.recv_idle() < heartbeat {
                    continue;
                }
                trace!("http conn {} send ping", state.conn_id);
                (PING_SEQ, ping.clone())
            }
        };
        // Ready once the previous exchange completes
        let ready = tokio::select! {
            r = tokio::time::timeout(dead_timeout, sender.ready()) => r,
            _ = close_rx.recv() => {
                sink.fail(seq, RpcIntErr::ConnLost);
                break;
            }
        };
        match ready {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!("http conn {} to {} not ready: {}", state.conn_id, state.addr, e);
                sink.fail(seq, RpcIntErr::ConnLost);
                break;
            }
            Err(_) => {
                warn!("http conn {} to {}: no response within {:?}, presumed dead", state.conn_id, state.addr, dead_timeout);
                sink.fail(seq, RpcIntErr::ConnLost);
                break;
            }
        }
        let req = match new_request(&state.addr, body) {
            Ok(req) => req,
            Err(e) => {
                sink.fail(seq, e);
                continue;
            }
        };
        state.activity.touch_send();
        let resp_f = sender.send_request(req);
        let state = state.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            match recv_response(resp_f, &state.addr).await {
                Ok(resp) => {
                    state.activity.touch_recv();
                    if let Err(e) = sink.on_frame(&resp) {
                        warn!("http conn {} malformed response: {}", state.conn_id, e);
                        sink.fail(seq, e);
                    }
                }
                Err(e) => {
                    sink.fail(seq, e);
                    if e == RpcIntErr::ConnLost {
                        state.close();
                    }
                }
            }
        });
    }
    state.close();
    trace!("http conn {} writer exit", state.conn_id);
}

async fn recv_response(
    resp_f: impl Future<Output = hyper::Result<Response<Incoming>>>, host: &str,
) -> Result<Bytes, RpcIntErr> {
    let resp = resp_f.await.map_err(|e| {
        warn!("http request to {} error: {}", host, e);
        RpcIntErr::ConnLost
    })?;
    if resp.status() != StatusCode::OK {
        warn!("http request to {} status {}", host, resp.status());
        return Err(RpcIntErr::Protocol);
    }
    match resp.into_body().collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => {
            warn!("http response from {} error: {}", host, e);
            Err(RpcIntErr::ConnLost)
        }
    }
}
