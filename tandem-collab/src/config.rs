//! Server and sequencer configuration.
//!
//! Defaults suit a single-node deployment. `ServerConfig::from_env` layers
//! `TANDEM_*` environment variables on top; invalid values are logged and
//! ignored.

use std::path::PathBuf;
use std::time::Duration;

use tandem_ot::CodecLimits;

/// When a document's state is checkpointed, and how failed flushes back off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPolicy {
    /// Flush after this many operations since the last checkpoint.
    pub max_ops: u64,
    /// Flush when the oldest unflushed operation is this old.
    pub max_interval: Duration,
    /// First retry delay after a failed flush; doubles per failure.
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Mark the document degraded once flushes have failed this long.
    pub degraded_after: Duration,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            max_ops: 100,
            max_interval: Duration::from_secs(5),
            retry_base: Duration::from_millis(250),
            retry_max: Duration::from_secs(10),
            degraded_after: Duration::from_secs(30),
        }
    }
}

/// Per-document sequencer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerConfig {
    /// Bounded submission queue per document.
    pub queue_depth: usize,
    /// How long a submitter waits for queue space before `SequencerBusy`.
    pub submit_timeout: Duration,
    /// How long a queued request waits for the actor's answer before
    /// `SequencerBusy`. The request may still be applied; retries carrying
    /// the same `client_op_id` are answered with the original version.
    pub reply_timeout: Duration,
    /// Evict a document this long after its last participant leaves.
    pub hibernate_after: Duration,
    /// Applied operations kept in memory for transforming stale submissions.
    pub transform_window: usize,
    pub checkpoint: CheckpointPolicy,
    pub codec_limits: CodecLimits,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            submit_timeout: Duration::from_millis(500),
            reply_timeout: Duration::from_secs(5),
            hibernate_after: Duration::from_secs(30),
            transform_window: 1024,
            checkpoint: CheckpointPolicy::default(),
            codec_limits: CodecLimits::default(),
        }
    }
}

impl SequencerConfig {
    /// Housekeeping cadence: checkpoint deadlines and idle checks.
    pub fn tick_interval(&self) -> Duration {
        let shortest = self
            .checkpoint
            .max_interval
            .min(self.hibernate_after)
            .min(self.checkpoint.retry_base);
        (shortest / 4).clamp(Duration::from_millis(5), Duration::from_secs(1))
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum participants per document session
    pub max_participants_per_document: usize,
    /// Outbound frame queue per connection; overflow drops the connection
    pub outbound_queue_capacity: usize,
    /// Interval clients are told to heartbeat at
    pub heartbeat_interval: Duration,
    /// Missed heartbeats before a connection is reaped
    pub missed_heartbeats: u32,
    /// How long a new connection may take to send `Hello`
    pub handshake_timeout: Duration,
    /// Persistence directory (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    pub sequencer: SequencerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_participants_per_document: 100,
            outbound_queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(10),
            missed_heartbeats: 3,
            handshake_timeout: Duration::from_secs(5),
            storage_path: None,
            sequencer: SequencerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Short timers and small queues.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_participants_per_document: 16,
            outbound_queue_capacity: 64,
            heartbeat_interval: Duration::from_millis(200),
            missed_heartbeats: 3,
            handshake_timeout: Duration::from_secs(2),
            storage_path: None,
            sequencer: SequencerConfig {
                queue_depth: 64,
                submit_timeout: Duration::from_millis(200),
                reply_timeout: Duration::from_secs(1),
                hibernate_after: Duration::from_millis(300),
                transform_window: 64,
                checkpoint: CheckpointPolicy {
                    max_ops: 10,
                    max_interval: Duration::from_millis(200),
                    retry_base: Duration::from_millis(20),
                    retry_max: Duration::from_millis(200),
                    degraded_after: Duration::from_millis(100),
                },
                codec_limits: CodecLimits::default(),
            },
        }
    }

    /// Defaults overridden by `TANDEM_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Time without any inbound frame after which a connection is reaped.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }

    /// Apply overrides from `lookup`. Unknown or invalid values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        if let Some(addr) = get("TANDEM_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(path) = get("TANDEM_STORAGE_PATH") {
            self.storage_path = Some(PathBuf::from(path));
        }
        if let Some(n) = parse(&get, "TANDEM_MAX_PARTICIPANTS") {
            self.max_participants_per_document = n;
        }
        if let Some(n) = parse(&get, "TANDEM_OUTBOUND_QUEUE") {
            self.outbound_queue_capacity = n;
        }
        if let Some(ms) = parse(&get, "TANDEM_HEARTBEAT_MS") {
            self.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&get, "TANDEM_MISSED_HEARTBEATS") {
            self.missed_heartbeats = n;
        }
        if let Some(n) = parse(&get, "TANDEM_QUEUE_DEPTH") {
            self.sequencer.queue_depth = n;
        }
        if let Some(ms) = parse(&get, "TANDEM_REPLY_TIMEOUT_MS") {
            self.sequencer.reply_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&get, "TANDEM_HIBERNATE_SECS") {
            self.sequencer.hibernate_after = Duration::from_secs(secs);
        }
        if let Some(n) = parse(&get, "TANDEM_TRANSFORM_WINDOW") {
            self.sequencer.transform_window = n;
        }
        if let Some(n) = parse(&get, "TANDEM_CHECKPOINT_OPS") {
            self.sequencer.checkpoint.max_ops = n;
        }
        if let Some(ms) = parse(&get, "TANDEM_CHECKPOINT_INTERVAL_MS") {
            self.sequencer.checkpoint.max_interval = Duration::from_millis(ms);
        }
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let raw = get(key)?;
    match raw.parse::<T>() {
        Ok(value) if value > T::default() => Some(value),
        Ok(_) => {
            log::warn!("{key} must be positive, ignoring {raw:?}");
            None
        }
        Err(err) => {
            log::warn!("invalid {key}, ignoring: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = ServerConfig::default();
        config.apply_overrides(|key| vars.get(key).cloned());
        config
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.sequencer.checkpoint.max_ops, 100);
        assert_eq!(config.sequencer.checkpoint.max_interval, Duration::from_secs(5));
        assert_eq!(config.sequencer.hibernate_after, Duration::from_secs(30));
        assert_eq!(config.liveness_timeout(), Duration::from_secs(30));
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = overrides(&[
            ("TANDEM_BIND_ADDR", " 0.0.0.0:7000 "),
            ("TANDEM_STORAGE_PATH", "/var/lib/tandem"),
            ("TANDEM_CHECKPOINT_OPS", "25"),
            ("TANDEM_HIBERNATE_SECS", "120"),
            ("TANDEM_HEARTBEAT_MS", "1500"),
            ("TANDEM_REPLY_TIMEOUT_MS", "750"),
        ]);
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/tandem")));
        assert_eq!(config.sequencer.checkpoint.max_ops, 25);
        assert_eq!(config.sequencer.hibernate_after, Duration::from_secs(120));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1500));
        assert_eq!(config.sequencer.reply_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_invalid_overrides_ignored() {
        let config = overrides(&[
            ("TANDEM_QUEUE_DEPTH", "lots"),
            ("TANDEM_CHECKPOINT_OPS", "0"),
            ("TANDEM_BIND_ADDR", "   "),
        ]);
        let defaults = ServerConfig::default();
        assert_eq!(config.sequencer.queue_depth, defaults.sequencer.queue_depth);
        assert_eq!(config.sequencer.checkpoint.max_ops, 100);
        assert_eq!(config.bind_addr, defaults.bind_addr);
    }

    #[test]
    fn test_tick_interval_bounds() {
        let config = ServerConfig::for_testing();
        let tick = config.sequencer.tick_interval();
        assert!(tick >= Duration::from_millis(5));
        assert!(tick <= Duration::from_secs(1));
        assert_eq!(SequencerConfig::default().tick_interval(), Duration::from_millis(62) + Duration::from_micros(500));
    }
}
