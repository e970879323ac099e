//! Configs for client, server and registry.

use std::time::Duration;

/// Interval of heartbeat ping, shared by both sides to agree on the idle timeout
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Frames larger than this are rejected as protocol error
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// General config for client-side
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Timeout of establishing a connection
    pub connect_timeout: Duration,
    /// Default timeout of a request, when the caller does not specify one
    pub task_timeout: Duration,
    /// Socket write timeout
    pub write_timeout: Duration,
    /// A ping is sent when the writer has been idle for this long
    pub heartbeat_interval: Duration,
    /// The connection is torn down when there's no inbound traffic
    /// within `heartbeat_interval * heartbeat_retry`
    pub heartbeat_retry: u32,
    /// The interval for sweeping timed-out requests
    pub timer_interval: Duration,
    /// Capacity of the per-connection write queue
    pub write_queue_size: usize,
    pub max_frame_size: usize,
    /// Carried in each request, checked by the server when it has one configured
    pub access_token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            task_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_retry: 3,
            timer_interval: Duration::from_secs(1),
            write_queue_size: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            access_token: None,
        }
    }
}

impl ClientConfig {
    /// The bounded window without inbound traffic, before the connection is presumed dead.
    #[inline]
    pub fn dead_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_retry.max(1)
    }
}

/// General config for server-side
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Socket write timeout
    pub write_timeout: Duration,
    /// Should match the heartbeat_interval of the clients,
    /// the idle timeout of a connection is three times of it.
    pub heartbeat_interval: Duration,
    /// Workers always alive in the pool
    pub core_workers: usize,
    /// Upper bound of workers, the extra ones exit after idle for `worker_keep_alive`
    pub max_workers: usize,
    pub worker_keep_alive: Duration,
    /// Capacity of the request queue in front of the workers
    pub queue_size: usize,
    /// wait for all in-flight requests to drain with a timeout
    pub server_close_wait: Duration,
    pub max_frame_size: usize,
    /// When set, requests carrying a different token are answered with error
    pub access_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(5),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            core_workers: 60,
            max_workers: 300,
            worker_keep_alive: Duration::from_secs(60),
            queue_size: 1000,
            server_close_wait: Duration::from_secs(90),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            access_token: None,
        }
    }
}

impl ServerConfig {
    /// Three heartbeat intervals, so a single dropped ping does not kill a healthy link.
    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

/// Config for the background loops of [RegistryClient](crate::registry::RegistryClient)
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Interval of republishing the local registration set
    pub register_interval: Duration,
    /// Sleep of the discovery loop while nothing is subscribed
    pub discovery_idle_interval: Duration,
    /// Sleep after a monitor call reporting no change, to avoid hot-looping
    pub monitor_backoff: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            register_interval: Duration::from_secs(10),
            discovery_idle_interval: Duration::from_secs(3),
            monitor_backoff: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_timeout_is_three_beats() {
        let config = ServerConfig { heartbeat_interval: Duration::from_millis(200), ..Default::default() };
        assert_eq!(config.idle_timeout(), Duration::from_millis(600));
        let client = ClientConfig { heartbeat_retry: 0, ..Default::default() };
        assert_eq!(client.dead_timeout(), client.heartbeat_interval);
    }
}
