//! Error types.
//!
//! - [RegistryError] is returned by the registry client and backends.
//! - [RpcIntErr] is the framework-internal failure of a request (timeout, connection, codec).
//! - [RpcError] is what a caller observes for a request: either an internal failure,
//!   or an error reported by the remote service invoker.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Malformed registry entry, rejected before any network I/O. Never retried.
    #[error("invalid registry entry: {0}")]
    Validation(String),
    /// Registry backend unreachable or failed. Loop-level retry on the next cycle.
    #[error("registry backend error: {0}")]
    Network(String),
}

/// Internal error of the rpc framework.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcIntErr {
    /// No response within the caller's bound
    #[error("rpc timeout")]
    Timeout,
    /// The connection died before the request was resolved
    #[error("connection lost")]
    ConnLost,
    /// The peer cannot be connected, or the connection is not active
    #[error("peer unreachable")]
    Unreachable,
    #[error("io error")]
    IO,
    #[error("encode error")]
    Encode,
    #[error("decode error")]
    Decode,
    /// Malformed or oversize frame
    #[error("protocol error")]
    Protocol,
    /// The server worker pool is exhausted
    #[error("server busy")]
    Busy,
    /// The client or server is closed
    #[error("closed")]
    Closed,
}

impl RpcIntErr {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "rpc timeout",
            Self::ConnLost => "connection lost",
            Self::Unreachable => "peer unreachable",
            Self::IO => "io error",
            Self::Encode => "encode error",
            Self::Decode => "decode error",
            Self::Protocol => "protocol error",
            Self::Busy => "server busy",
            Self::Closed => "closed",
        }
    }
}

impl From<std::io::Error> for RpcIntErr {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::AddrNotAvailable
            | std::io::ErrorKind::NotConnected => Self::Unreachable,
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::ConnLost,
            _ => Self::IO,
        }
    }
}

/// The outcome of a failed request, as observed by the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("{0}")]
    Rpc(RpcIntErr),
    /// The remote service invoker failed, carrying its textual description.
    #[error("invocation error: {0}")]
    Invocation(String),
}

impl From<RpcIntErr> for RpcError {
    #[inline]
    fn from(e: RpcIntErr) -> Self {
        Self::Rpc(e)
    }
}

impl RpcError {
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Rpc(RpcIntErr::Timeout))
    }
}
