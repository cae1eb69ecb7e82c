//! Tunnel tuning knobs, loaded from environment variables.
//!
//! Every knob has a compiled-in default; unset or unparsable variables fall
//! back to it rather than failing startup.

use std::time::Duration;

pub const DEFAULT_PING_WRITE_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_PING_WAIT_MS: u64 = 60_000;
pub const DEFAULT_MAX_READ: usize = frames::DEFAULT_MAX_PAYLOAD;
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_READ_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_READ_BUFFER_WAIT_MS: u64 = 5_000;
pub const DEFAULT_ACCEPT_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 15_000;

/// Per-session settings shared by the server and the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Cadence of transport-level pings.
    pub ping_write_interval: Duration,
    /// Session is torn down when no pong arrives for this long.
    pub ping_wait_duration: Duration,
    /// Largest Data payload per frame, and cap on declared lengths.
    pub max_read: usize,
    /// Bounded outbound frame queue feeding the write pump.
    pub write_queue_capacity: usize,
    /// Buffered inbound Data frames per virtual connection.
    pub read_queue_capacity: usize,
    /// How long the read pump waits on a full connection buffer before
    /// closing that connection.
    pub read_buffer_wait: Duration,
    /// Incoming Connect requests waiting for the agent to pick them up.
    pub accept_queue_capacity: usize,
    /// Dial timeout when neither the caller nor the Connect frame sets one.
    pub dial_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ping_write_interval: Duration::from_millis(DEFAULT_PING_WRITE_INTERVAL_MS),
            ping_wait_duration: Duration::from_millis(DEFAULT_PING_WAIT_MS),
            max_read: DEFAULT_MAX_READ,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            read_queue_capacity: DEFAULT_READ_QUEUE_CAPACITY,
            read_buffer_wait: Duration::from_millis(DEFAULT_READ_BUFFER_WAIT_MS),
            accept_queue_capacity: DEFAULT_ACCEPT_QUEUE_CAPACITY,
            dial_timeout: Duration::from_millis(DEFAULT_DIAL_TIMEOUT_MS),
        }
    }
}

impl TunnelConfig {
    /// Build config from environment variables.
    ///
    /// - `TUNNEL_PING_WRITE_INTERVAL_MS`: default 5000
    /// - `TUNNEL_PING_WAIT_MS`: default 60000
    /// - `TUNNEL_MAX_READ`: default 8192
    /// - `TUNNEL_WRITE_QUEUE_CAPACITY`: default 256
    /// - `TUNNEL_READ_QUEUE_CAPACITY`: default 256
    /// - `TUNNEL_READ_BUFFER_WAIT_MS`: default 5000
    /// - `TUNNEL_ACCEPT_QUEUE_CAPACITY`: default 64
    /// - `TUNNEL_DIAL_TIMEOUT_MS`: default 15000
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            ping_write_interval: Duration::from_millis(env_parse(
                "TUNNEL_PING_WRITE_INTERVAL_MS",
                DEFAULT_PING_WRITE_INTERVAL_MS,
            )),
            ping_wait_duration: Duration::from_millis(env_parse("TUNNEL_PING_WAIT_MS", DEFAULT_PING_WAIT_MS)),
            max_read: env_parse("TUNNEL_MAX_READ", DEFAULT_MAX_READ).max(1),
            write_queue_capacity: env_parse("TUNNEL_WRITE_QUEUE_CAPACITY", DEFAULT_WRITE_QUEUE_CAPACITY).max(1),
            read_queue_capacity: env_parse("TUNNEL_READ_QUEUE_CAPACITY", DEFAULT_READ_QUEUE_CAPACITY).max(1),
            read_buffer_wait: Duration::from_millis(env_parse("TUNNEL_READ_BUFFER_WAIT_MS", DEFAULT_READ_BUFFER_WAIT_MS)),
            accept_queue_capacity: env_parse("TUNNEL_ACCEPT_QUEUE_CAPACITY", DEFAULT_ACCEPT_QUEUE_CAPACITY).max(1),
            dial_timeout: Duration::from_millis(env_parse("TUNNEL_DIAL_TIMEOUT_MS", DEFAULT_DIAL_TIMEOUT_MS)),
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
