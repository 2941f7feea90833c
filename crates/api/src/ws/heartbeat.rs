use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bulkedit_core::types::Timestamp;
use chrono::{TimeZone, Utc};

/// Heartbeat cadence and peer-silence limit for WebSocket connections.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Interval between Ping frames sent by the writer.
    pub interval: Duration,
    /// A peer silent for longer than this is disconnected.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }
}

/// Last time a connection's peer was heard from.
///
/// Written by the reader half on every inbound frame, read by the writer
/// half on every heartbeat tick.
#[derive(Debug)]
pub struct Liveness {
    last_seen_ms: AtomicI64,
}

impl Liveness {
    pub fn new(now: Timestamp) -> Self {
        Self {
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn touch(&self) {
        self.touch_at(Utc::now());
    }

    pub fn touch_at(&self, now: Timestamp) {
        self.last_seen_ms
            .fetch_max(now.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> Timestamp {
        Utc.timestamp_millis_opt(self.last_seen_ms.load(Ordering::Relaxed))
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Whether the peer has been silent for longer than `timeout` at `now`.
    pub fn is_stale(&self, now: Timestamp, timeout: Duration) -> bool {
        let silent_ms = now.timestamp_millis() - self.last_seen_ms.load(Ordering::Relaxed);
        silent_ms > timeout.as_millis() as i64
    }
}
