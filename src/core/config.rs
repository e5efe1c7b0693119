//! Centralized configuration for the transport core.
//!
//! Tunable defaults live here as constants so they can be reviewed in one
//! place. [`TransportConfig`] bundles the values a running node consumes and
//! can be loaded from the `[transport]` table of a TOML file. Wire-format
//! constants (frame type names) stay in their respective modules.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Chunking ─────────────────────────────────────────────────────────────────

/// Default maximum serialized payload (bytes) sent as a single frame.
///
/// Anything larger is split into `chunk-data` frames of at most this size.
/// 16 KB is the largest message size every data-channel implementation is
/// guaranteed to accept without fragmentation issues.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Fixed delay between successive chunk frames of one transfer.
pub const CHUNK_PACING: Duration = Duration::from_millis(10);

/// Maximum concurrent incoming chunked transfers per remote peer.
/// A peer announcing more transfers than this gets its new metas rejected.
pub const MAX_REASSEMBLY_BUFFERS_PER_PEER: usize = 64;

/// Upper bound on `totalChunks` accepted from a `chunk-meta` frame.
/// Senders refuse messages that would need more.
pub const MAX_CHUNKS_PER_MESSAGE: u32 = 16 * 1024;

/// Completed chunk ids remembered per peer so a late repeated `chunk-meta`
/// does not reopen a finished transfer.
pub const RECENTLY_COMPLETED_PER_PEER: usize = 64;

// ── Signaling ────────────────────────────────────────────────────────────────

/// Interval between heartbeat PINGs on an open signaling connection.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Prefix of the timer task name each signaling channel registers its
/// heartbeat under. The full name also carries the peer id and server URL.
pub const HEARTBEAT_TASK: &str = "signaling-heartbeat";

/// Timeout for the WebSocket handshake with the rendezvous server.
pub const SIGNALING_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Auto-reconnect ──────────────────────────────────────────────────────────

/// Reconnect attempts after an unexpected close before giving up.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Delay before the first reconnect attempt.
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(2000);

/// Multiplier applied to the delay for every further attempt.
pub const RECONNECT_BACKOFF_FACTOR: f64 = 2.0;

/// Ceiling for the computed reconnect delay.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_millis(30_000);

// ── Reconnect policy ─────────────────────────────────────────────────────────

/// Exponential backoff schedule for signaling reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RECONNECT_MAX_ATTEMPTS,
            initial_delay_ms: RECONNECT_INITIAL_DELAY.as_millis() as u64,
            backoff_factor: RECONNECT_BACKOFF_FACTOR,
            max_delay_ms: RECONNECT_MAX_DELAY.as_millis() as u64,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before reconnect attempt number `attempt` (1-based).
    ///
    /// Returns `None` once the attempt budget is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let exp = self.backoff_factor.powi(attempt as i32 - 1);
        let raw = self.initial_delay_ms as f64 * exp;
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Some(Duration::from_millis(capped as u64))
    }
}

// ── Transport config ─────────────────────────────────────────────────────────

/// Runtime configuration consumed by the signaling channel and chunk transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum single-frame payload in bytes.
    pub chunk_size: usize,
    /// Delay between successive chunk frames, in milliseconds.
    pub chunk_pacing_ms: u64,
    /// Signaling heartbeat interval, in milliseconds.
    pub heartbeat_interval_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            chunk_pacing_ms: CHUNK_PACING.as_millis() as u64,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL.as_millis() as u64,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Shape of the TOML file: transport settings live under `[transport]`.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    transport: TransportConfig,
}

impl TransportConfig {
    pub fn chunk_pacing(&self) -> Duration {
        Duration::from_millis(self.chunk_pacing_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Parse the `[transport]` table of a TOML document. Missing keys keep
    /// their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content).context("invalid transport config")?;
        file.transport.validated()
    }

    /// Reject values the transport cannot operate with.
    pub fn validated(self) -> Result<Self> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk_size must be greater than zero");
        }
        if self.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat_interval_ms must be greater than zero");
        }
        if self.reconnect.backoff_factor < 1.0 {
            anyhow::bail!("reconnect.backoff_factor must be at least 1.0");
        }
        Ok(self)
    }
}
