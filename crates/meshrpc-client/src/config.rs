use std::time::Duration;

/// Per-destination channel pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle-pool capacity per destination node
    pub max_connections_per_node: usize,
    /// Socket open deadline in milliseconds
    pub connect_timeout_ms: u64,
    /// Queued-waiter deadline for a write, measured from request creation.
    /// The first write on a freshly opened socket additionally gets the open
    /// budget on top of this.
    pub write_timeout_ms: u64,
    /// Connection max-age: `< 0` never age out, `0` close after a single
    /// write, `> 0` close once the connection is that many milliseconds old
    pub close_channel_time_ms: i64,
    /// Queued requests older than this are failed by the sweeper; 0 disables
    pub stale_request_timeout_mins: u64,
    /// How often the stale sweeper runs; 0 disables
    pub stale_request_cleanup_freq_mins: u64,
    /// Optional cap on the waiting-writes queue; `None` is unbounded
    pub max_write_queue_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_node: 8,
            connect_timeout_ms: 1000,
            write_timeout_ms: 150,
            close_channel_time_ms: -1,
            stale_request_timeout_mins: 10,
            stale_request_cleanup_freq_mins: 10,
            max_write_queue_size: None,
        }
    }
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Retry policy applied when the caller does not pass an explicit budget.
///
/// `max_retries` counts re-issues beyond the first attempt, so a request with
/// `max_retries = k` makes at most `k + 1` write attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 0 }
    }
}

/// Rolling statistics tuning.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Sliding window for latency percentiles, in milliseconds
    pub request_statistics_window_ms: u64,
    /// TTL of every cached derived statistic, in milliseconds
    pub refresh_interval_ms: u64,
    /// Health-score outlier multiplier
    pub outlier_multiplier: f64,
    /// Health-score outlier constant
    pub outlier_constant: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            request_statistics_window_ms: 30_000,
            refresh_interval_ms: 1000,
            outlier_multiplier: 2.0,
            outlier_constant: 10.0,
        }
    }
}

/// Response-callback dispatch tuning.
///
/// Callbacks are dispatched onto a bounded worker pool so user code never
/// stalls a connection reader. `max_pool_size` bounds concurrently running
/// callbacks and `max_waiting_queue_size` bounds callbacks parked behind
/// them; past both, callbacks run inline on the submitting task with a
/// warning. `core_pool_size` and `keep_alive_time_ms` are accepted for
/// tuning parity but spawning is cheap on the async runtime, so only the
/// concurrency ceiling and the queue bound take effect.
#[derive(Debug, Clone)]
pub struct ResponseHandlerConfig {
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub keep_alive_time_ms: u64,
    pub max_waiting_queue_size: usize,
}

impl Default for ResponseHandlerConfig {
    fn default() -> Self {
        Self {
            core_pool_size: 4,
            max_pool_size: 8,
            keep_alive_time_ms: 60_000,
            max_waiting_queue_size: 1024,
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub pool: PoolConfig,
    pub retry: RetryPolicy,
    pub stats: StatsConfig,
    pub response_handler: ResponseHandlerConfig,
    /// Deadline applied by the awaitable [`request`] adapter, in milliseconds
    ///
    /// [`request`]: crate::NetworkClient::request
    pub request_timeout_ms: u64,
    /// How long pools of departed nodes keep serving in-flight work before
    /// being closed, in milliseconds
    pub membership_grace_ms: u64,
    /// Permits the retry path to re-issue against the node that just failed,
    /// for degenerate balancers that legitimately return the same node twice
    pub duplicates_ok: bool,
    /// Optional mirror destination for shadow traffic. Reserved: recorded in
    /// the configuration but not consulted by the core request path.
    pub dark_canary_service_name: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            stats: StatsConfig::default(),
            response_handler: ResponseHandlerConfig::default(),
            request_timeout_ms: 30_000,
            membership_grace_ms: 2000,
            duplicates_ok: false,
            dark_canary_service_name: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections_per_node, 8);
        assert_eq!(config.connect_timeout_ms, 1000);
        assert_eq!(config.write_timeout_ms, 150);
        assert_eq!(config.close_channel_time_ms, -1);
        assert_eq!(config.stale_request_timeout_mins, 10);
        assert_eq!(config.stale_request_cleanup_freq_mins, 10);
        assert!(config.max_write_queue_size.is_none());
    }

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.request_timeout_ms, 30_000);
        assert!(!config.duplicates_ok);
        assert!(config.dark_canary_service_name.is_none());
    }

    #[test]
    fn test_response_handler_defaults() {
        let config = ResponseHandlerConfig::default();
        assert!(config.core_pool_size <= config.max_pool_size);
        assert_eq!(config.max_waiting_queue_size, 1024);
    }
}
