//! Engine configuration.

use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of offload worker threads
pub const DEFAULT_WORKERS: usize = 4;

/// Default upper bound on a single readiness wait, in milliseconds
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 50;

/// Default bounded wait of an idle worker before it re-checks for shutdown, in milliseconds
pub const DEFAULT_WORKER_WAIT_MS: u64 = 100;

/// Default pause between passes of the scanning poller, in milliseconds
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 5;

/// Default size of a single socket read
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// Default maximum frame payload (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default number of break notifications buffered for tokens that are not registered yet
pub const DEFAULT_MAX_ORPHAN_BREAKS: usize = 64;

/// Default number of readiness events collected per poll
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Prefix of the environment variables read by [`EngineConfig::from_env`]
pub const ENV_PREFIX: &str = "SMBMUX_";

/// Tunables of the engine.
///
/// Deserializes from any serde format with every field optional; durations are written in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads in an offload pool
    pub workers: usize,
    /// Upper bound on a single readiness wait inside the loop helpers
    #[serde(with = "millis", rename = "poll_timeout_ms")]
    pub poll_timeout: Duration,
    /// Bounded wait of an idle worker before it re-checks for shutdown
    #[serde(with = "millis", rename = "worker_wait_ms")]
    pub worker_wait: Duration,
    /// Pause between passes of the scanning poller
    #[serde(with = "millis", rename = "scan_interval_ms")]
    pub scan_interval: Duration,
    /// Size of a single socket read
    pub read_chunk: usize,
    /// Largest accepted frame payload; larger frames are a framing error
    pub max_frame_size: usize,
    /// Break notifications buffered while no registration exists for their token.
    /// Zero turns every such notification into a connection error.
    pub max_orphan_breaks: usize,
    /// Readiness events collected per poll by the OS queue backend
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            workers: DEFAULT_WORKERS,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            worker_wait: Duration::from_millis(DEFAULT_WORKER_WAIT_MS),
            scan_interval: Duration::from_millis(DEFAULT_SCAN_INTERVAL_MS),
            read_chunk: DEFAULT_READ_CHUNK,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_orphan_breaks: DEFAULT_MAX_ORPHAN_BREAKS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `SMBMUX_*` environment variables, e.g. `SMBMUX_WORKERS=8` or
    /// `SMBMUX_POLL_TIMEOUT_MS=10`.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up by full variable name. Unset variables keep their current value.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        override_with(&mut self.workers, "WORKERS", get("WORKERS"))?;
        override_millis(&mut self.poll_timeout, "POLL_TIMEOUT_MS", get("POLL_TIMEOUT_MS"))?;
        override_millis(&mut self.worker_wait, "WORKER_WAIT_MS", get("WORKER_WAIT_MS"))?;
        override_millis(&mut self.scan_interval, "SCAN_INTERVAL_MS", get("SCAN_INTERVAL_MS"))?;
        override_with(&mut self.read_chunk, "READ_CHUNK", get("READ_CHUNK"))?;
        override_with(&mut self.max_frame_size, "MAX_FRAME_SIZE", get("MAX_FRAME_SIZE"))?;
        override_with(&mut self.max_orphan_breaks, "MAX_ORPHAN_BREAKS", get("MAX_ORPHAN_BREAKS"))?;
        override_with(&mut self.event_capacity, "EVENT_CAPACITY", get("EVENT_CAPACITY"))?;

        self.validate()?;
        Ok(self)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid_state("workers must be at least 1"));
        }
        if self.read_chunk == 0 {
            return Err(Error::invalid_state("read_chunk must be at least 1"));
        }
        if self.worker_wait.is_zero() {
            return Err(Error::invalid_state("worker_wait must be non-zero"));
        }
        Ok(())
    }
}

fn override_with<T: FromStr>(field: &mut T, name: &str, value: Option<String>) -> Result<()> {
    if let Some(value) = value {
        *field = value.trim().parse().map_err(|_| {
            Error::invalid_state(format!("{ENV_PREFIX}{name}: cannot parse {value:?}"))
        })?;
    }
    Ok(())
}

fn override_millis(field: &mut Duration, name: &str, value: Option<String>) -> Result<()> {
    let mut ms = field.as_millis() as u64;
    override_with(&mut ms, name, value)?;
    *field = Duration::from_millis(ms);
    Ok(())
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
