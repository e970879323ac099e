//! The wire protocol.
//!
//! ## Frame
//!
//! On stream transports, each message is a frame:
//!
//! ```text
//! +-----------------+------------------------------+
//! | len: u32 (BE)   | body: codec payload (len)    |
//! +-----------------+------------------------------+
//! ```
//!
//! The body is a [RpcRequest] from client to server, or a [RpcResponse] from server to client,
//! serialized with the [Codec]. `len` larger than the configured `max_frame_size` is a protocol
//! error, and the connection is closed.
//!
//! On the HTTP transport, the body of a POST (and of its response) is the codec payload,
//! without the length header.
//!
//! ## Sequence
//!
//! `seq` is unique within the process, assigned by [next_seq()]. [PING_SEQ] (zero) is reserved for
//! heartbeat: a request with it is a ping, never reaches the service invoker, and is answered
//! with a response of the same `seq` (pong).

use crate::{Codec, RpcError, RpcIntErr};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The reserved seq for heartbeat ping / pong
pub const PING_SEQ: u64 = 0;

pub const FRAME_HEADER_LEN: usize = 4;

static SEQ: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique request identifier, never equal to [PING_SEQ].
#[inline]
pub fn next_seq() -> u64 {
    loop {
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        if seq != PING_SEQ {
            return seq;
        }
    }
}

/// The delivery contract of a request, governing how the caller observes the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallType {
    /// The caller waits for the result
    Sync,
    /// The caller gets a handle, to wait or poll later
    Future,
    /// A completion handler is invoked exactly once
    Callback,
    /// Fire and forget, no response is tracked
    Oneway,
}

impl CallType {
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sync => "SYNC",
            Self::Future => "FUTURE",
            Self::Callback => "CALLBACK",
            Self::Oneway => "ONEWAY",
        }
    }

    /// Match by name, returns `default` when the name is unknown
    pub fn from_name(name: &str, default: CallType) -> CallType {
        for item in [Self::Sync, Self::Future, Self::Callback, Self::Oneway] {
            if item.name() == name {
                return item;
            }
        }
        default
    }

    /// Whether a pending entry is tracked for the response
    #[inline]
    pub fn need_resp(&self) -> bool {
        *self != Self::Oneway
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    pub seq: u64,
    /// The service key, as published to the registry
    pub service: String,
    pub method: String,
    /// Arguments, encoded by the codec of the caller
    pub params: Vec<u8>,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl RpcRequest {
    pub fn new(service: impl Into<String>, method: impl Into<String>, params: Vec<u8>) -> Self {
        Self {
            seq: next_seq(),
            service: service.into(),
            method: method.into(),
            params,
            access_token: None,
        }
    }

    #[inline]
    pub fn ping() -> Self {
        Self {
            seq: PING_SEQ,
            service: String::new(),
            method: String::new(),
            params: Vec::new(),
            access_token: None,
        }
    }

    #[inline]
    pub fn is_ping(&self) -> bool {
        self.seq == PING_SEQ
    }
}

impl fmt::Debug for RpcRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_ping() {
            return write!(f, "req(ping)");
        }
        write!(f, "req(seq={}, {}.{}, {} bytes)", self.seq, self.service, self.method, self.params.len())
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub seq: u64,
    #[serde(default)]
    pub result: Option<Vec<u8>>,
    /// Set when the request failed on the server, with a textual description
    #[serde(default)]
    pub error: Option<String>,
}

impl RpcResponse {
    #[inline]
    pub fn ok(seq: u64, result: Vec<u8>) -> Self {
        Self { seq, result: Some(result), error: None }
    }

    #[inline]
    pub fn err(seq: u64, error: impl Into<String>) -> Self {
        Self { seq, result: None, error: Some(error.into()) }
    }

    #[inline]
    pub fn pong() -> Self {
        Self { seq: PING_SEQ, result: None, error: None }
    }

    #[inline]
    pub fn is_pong(&self) -> bool {
        self.seq == PING_SEQ
    }

    /// Convert into the outcome observed by the caller. An error response never yields a result.
    pub fn into_result(self) -> Result<Vec<u8>, RpcError> {
        if let Some(e) = self.error {
            return Err(RpcError::Invocation(e));
        }
        Ok(self.result.unwrap_or_default())
    }
}

impl fmt::Debug for RpcResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_pong() {
            return write!(f, "resp(pong)");
        }
        match &self.error {
            Some(e) => write!(f, "resp(seq={}, err={:?})", self.seq, e),
            None => write!(
                f,
                "resp(seq={}, {} bytes)",
                self.seq,
                self.result.as_ref().map(|r| r.len()).unwrap_or(0)
            ),
        }
    }
}

/// Encode a message into a length-delimited frame
pub fn encode_frame<C: Codec, T: Serialize>(codec: &C, msg: &T) -> Result<Vec<u8>, RpcIntErr> {
    let mut buf = Vec::with_capacity(128);
    buf.extend_from_slice(&[0u8; FRAME_HEADER_LEN]);
    let size = codec.encode_into(msg, &mut buf).map_err(|_| RpcIntErr::Encode)?;
    if size > u32::MAX as usize {
        return Err(RpcIntErr::Encode);
    }
    buf[..FRAME_HEADER_LEN].copy_from_slice(&(size as u32).to_be_bytes());
    Ok(buf)
}

/// Read the body of one frame into `buf`, returns `Ok(false)` on clean EOF before a header.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R, buf: &mut Vec<u8>, max_frame_size: usize,
) -> Result<bool, RpcIntErr> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame_size {
        warn!("frame size {} exceeds limit {}", len, max_frame_size);
        return Err(RpcIntErr::Protocol);
    }
    buf.clear();
    buf.resize(len, 0);
    reader.read_exact(&mut buf[..]).await?;
    Ok(true)
}

/// Write a pre-encoded frame and flush
#[inline]
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
