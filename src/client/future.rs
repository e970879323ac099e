use super::correlation::{CorrelationTable, RpcResult};
use crate::{Codec, RpcError, RpcIntErr};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot::{self, error::TryRecvError};

/// The handle of a FUTURE call.
///
/// The caller may poll it with [try_get()](Self::try_get), or wait on it later. Once terminal,
/// all subsequent polls and waits observe the same outcome.
pub struct RpcFuture {
    seq: u64,
    rx: Option<oneshot::Receiver<RpcResult>>,
    res: Option<RpcResult>,
    table: Arc<CorrelationTable>,
}

impl RpcFuture {
    pub(crate) fn new(seq: u64, rx: oneshot::Receiver<RpcResult>, table: Arc<CorrelationTable>) -> Self {
        Self { seq, rx: Some(rx), res: None, table }
    }

    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.res.is_some()
    }

    #[inline]
    fn finish(&mut self, res: RpcResult) -> RpcResult {
        self.rx = None;
        self.res = Some(res.clone());
        res
    }

    /// Non-blocking poll, returns None while the request is still pending.
    pub fn try_get(&mut self) -> Option<RpcResult> {
        if let Some(res) = self.res.as_ref() {
            return Some(res.clone());
        }
        let rx = self.rx.as_mut()?;
        match rx.try_recv() {
            Ok(res) => Some(self.finish(res)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(self.finish(Err(RpcIntErr::ConnLost.into()))),
        }
    }

    /// Wait for the outcome, bounded by the request deadline (enforced by the client timer).
    pub async fn get(&mut self) -> RpcResult {
        if let Some(res) = self.res.as_ref() {
            return res.clone();
        }
        let res = match self.rx.as_mut() {
            Some(rx) => match rx.await {
                Ok(res) => res,
                Err(_) => Err(RpcIntErr::ConnLost.into()),
            },
            None => Err(RpcIntErr::ConnLost.into()),
        };
        self.finish(res)
    }

    /// Wait with a caller-specified timeout. On expiry the pending request is purged,
    /// and Timeout becomes the terminal outcome.
    pub async fn get_timeout(&mut self, timeout: Duration) -> RpcResult {
        if let Some(res) = self.res.as_ref() {
            return res.clone();
        }
        let Some(rx) = self.rx.as_mut() else {
            return self.finish(Err(RpcIntErr::ConnLost.into()));
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(res)) => self.finish(res),
            Ok(Err(_)) => self.finish(Err(RpcIntErr::ConnLost.into())),
            Err(_) => {
                if self.table.take(self.seq).is_some() {
                    debug!("future seq={} timeout after {:?}", self.seq, timeout);
                    self.finish(Err(RpcIntErr::Timeout.into()))
                } else {
                    // Taken by a resolver concurrently, which always delivers
                    let res = match self.rx.as_mut() {
                        Some(rx) => rx.await.unwrap_or(Err(RpcIntErr::Timeout.into())),
                        None => Err(RpcIntErr::Timeout.into()),
                    };
                    self.finish(res)
                }
            }
        }
    }

    /// Wait and decode the result with codec
    pub async fn get_as<C: Codec, R: DeserializeOwned>(&mut self, codec: &C) -> Result<R, RpcError> {
        let buf = self.get().await?;
        codec.decode::<R>(&buf).map_err(|_| RpcIntErr::Decode.into())
    }
}

impl Drop for RpcFuture {
    fn drop(&mut self) {
        // Nobody will observe the outcome
        if self.res.is_none() {
            self.table.take(self.seq);
        }
    }
}
