//! Grid tuning

use std::time::Duration;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Transport configuration shared by all connections of a manager
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Bound on dial plus handshake
    pub handshake_timeout: Duration,
    /// Frames queued for the writer task of one link
    pub out_queue: usize,
    /// Health-check period of initiator links
    pub ping_interval: Duration,
    /// A ping slower than this resets the link
    pub ping_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            out_queue: 10_000,
            ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl GridConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = interval;
        self.ping_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_out_queue(mut self, out_queue: usize) -> Self {
        self.out_queue = out_queue;
        self
    }
}
