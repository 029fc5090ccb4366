//! Protocol timing configuration.
//!
//! Every timer the engine runs is driven by one of these values so tests can
//! shrink them without touching the protocol logic.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default retry-scan tick in milliseconds.
pub const DEFAULT_RETRY_TICK_MS: u64 = 10;
/// Default unacknowledged-message resend deadline in milliseconds.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 3000;
/// Default pong wait per ping round in milliseconds.
pub const DEFAULT_PING_TIMEOUT_MS: u64 = 5000;
/// Default server-side close grace window in milliseconds.
pub const DEFAULT_CLOSE_GRACE_MS: u64 = 5000;
/// Default client reconnect retry delay in milliseconds.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 500;
/// Default ping-loop backoff while disconnected in milliseconds.
pub const DEFAULT_DISCONNECTED_BACKOFF_MS: u64 = 100;
/// Default HTTP long-poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
/// Default rate-limit window in milliseconds.
pub const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 1000;
/// Default route sends allowed per window before the advisory 429.
pub const DEFAULT_RATE_LIMIT_MAX: u32 = 100;

/// Timing knobs for a connection and its transports.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolConfig {
    /// Retry-scan tick (default: 10 ms).
    #[serde(default = "default_retry_tick_ms")]
    pub retry_tick_ms: u64,
    /// Resend an unacknowledged envelope after this long (default: 3000 ms).
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Pong wait per ping round; silence closes the connection (default: 5000 ms).
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Server-side grace after a transport drop before `on_close` (default: 5000 ms).
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    /// Client retry delay after an unexpected transport drop (default: 500 ms).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Ping-loop backoff while the transport is down (default: 100 ms).
    #[serde(default = "default_disconnected_backoff_ms")]
    pub disconnected_backoff_ms: u64,
    /// Long-poll GET interval (default: 1000 ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Rate-limit window (default: 1000 ms).
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,
    /// Route sends allowed per window before the advisory 429 (default: 100).
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: u32,
}

fn default_retry_tick_ms() -> u64 {
    DEFAULT_RETRY_TICK_MS
}
fn default_ack_timeout_ms() -> u64 {
    DEFAULT_ACK_TIMEOUT_MS
}
fn default_ping_timeout_ms() -> u64 {
    DEFAULT_PING_TIMEOUT_MS
}
fn default_close_grace_ms() -> u64 {
    DEFAULT_CLOSE_GRACE_MS
}
fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}
fn default_disconnected_backoff_ms() -> u64 {
    DEFAULT_DISCONNECTED_BACKOFF_MS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_rate_limit_window_ms() -> u64 {
    DEFAULT_RATE_LIMIT_WINDOW_MS
}
fn default_rate_limit_max() -> u32 {
    DEFAULT_RATE_LIMIT_MAX
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            retry_tick_ms: DEFAULT_RETRY_TICK_MS,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            ping_timeout_ms: DEFAULT_PING_TIMEOUT_MS,
            close_grace_ms: DEFAULT_CLOSE_GRACE_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            disconnected_backoff_ms: DEFAULT_DISCONNECTED_BACKOFF_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            rate_limit_window_ms: DEFAULT_RATE_LIMIT_WINDOW_MS,
            rate_limit_max: DEFAULT_RATE_LIMIT_MAX,
        }
    }
}

impl ProtocolConfig {
    /// Retry-scan tick as a [`Duration`].
    #[must_use]
    pub fn retry_tick(&self) -> Duration {
        Duration::from_millis(self.retry_tick_ms)
    }

    /// Ack timeout as a [`Duration`].
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Ping timeout as a [`Duration`].
    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    /// Close grace as a [`Duration`].
    #[must_use]
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Reconnect delay as a [`Duration`].
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Disconnected backoff as a [`Duration`].
    #[must_use]
    pub fn disconnected_backoff(&self) -> Duration {
        Duration::from_millis(self.disconnected_backoff_ms)
    }

    /// Poll interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Rate-limit window as a [`Duration`].
    #[must_use]
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }
}
