use super::correlation::CorrelationTable;
use crossfire::MAsyncRx;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Check the deadline of pending requests in batch, until the client is closed.
pub(crate) async fn sweep_loop(table: Arc<CorrelationTable>, interval: Duration, close_rx: MAsyncRx<()>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let count = table.sweep(Instant::now());
                if count > 0 {
                    debug!("timer: {} requests timed out, {} pending", count, table.len());
                }
            }
            _ = close_rx.recv() => break,
        }
    }
    trace!("timer exit");
}
