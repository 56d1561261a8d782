//! Engine configuration (layered: code > env > config file > defaults).

use std::path::{Path, PathBuf};

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::OutflowError;
use crate::run::approvals::ApprovalPolicy;
use crate::util::RetryPolicy;

pub const DEFAULT_MAX_STEPS: usize = 20;
pub const DEFAULT_MAX_BUFFERED_CHUNKS: usize = 10_000;
pub const DEFAULT_MAX_RETAINED_STEPS: usize = 256;
pub const DEFAULT_STREAM_IDLE_TIMEOUT_MS: u64 = 120_000;

const MAX_STEPS_ENV: &str = "OUTFLOW_MAX_STEPS";
const MAX_BUFFERED_CHUNKS_ENV: &str = "OUTFLOW_MAX_BUFFERED_CHUNKS";
const MAX_RETAINED_STEPS_ENV: &str = "OUTFLOW_MAX_RETAINED_STEPS";
const STREAM_IDLE_TIMEOUT_ENV: &str = "OUTFLOW_STREAM_IDLE_TIMEOUT_MS";
const TOOL_TIMEOUT_ENV: &str = "OUTFLOW_TOOL_TIMEOUT_MS";
const CONFIG_FILE_NAME: &str = "outflow.toml";

/// Which chunks the safety ceiling evicts first.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EvictionStrategy {
    /// Once over the ceiling, drop every chunk all attached subscribers
    /// have read, and at least enough of the oldest to get back under it.
    #[default]
    ConsumedFirst,
    /// Drop only the overflow, oldest first, read or not. Keeps the most
    /// replay history for late subscribers.
    OldestFirst,
}

/// When a run's buffers are released.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReleaseTrigger {
    /// As soon as the run is terminal and every subscriber has read the
    /// terminal chunk.
    #[default]
    TerminalAndDrained,
    /// Additionally wait until the last `ModelOutput` handle is dropped, so
    /// subscribers attaching after completion still get a replay.
    OutputDropped,
}

/// Retention limits for one run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Builder)]
#[serde(default)]
pub struct BufferPolicy {
    /// Hard ceiling on chunks held by the broadcaster.
    #[builder(default = DEFAULT_MAX_BUFFERED_CHUNKS)]
    pub max_buffered_chunks: usize,
    /// Hard ceiling on step results held by the run accumulator.
    #[builder(default = DEFAULT_MAX_RETAINED_STEPS)]
    pub max_retained_steps: usize,
    #[builder(default)]
    pub eviction: EvictionStrategy,
    #[builder(default)]
    pub release: ReleaseTrigger,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            max_buffered_chunks: DEFAULT_MAX_BUFFERED_CHUNKS,
            max_retained_steps: DEFAULT_MAX_RETAINED_STEPS,
            eviction: EvictionStrategy::default(),
            release: ReleaseTrigger::default(),
        }
    }
}

/// Configuration for an [`Engine`](crate::run::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct EngineConfig {
    /// Step budget per run.
    #[builder(default = DEFAULT_MAX_STEPS)]
    pub max_steps: usize,
    #[builder(default)]
    pub buffer: BufferPolicy,
    #[builder(default)]
    pub approval_policy: ApprovalPolicy,
    /// Longest gap between provider events; `0` disables the check.
    #[builder(default = DEFAULT_STREAM_IDLE_TIMEOUT_MS)]
    pub stream_idle_timeout_ms: u64,
    /// Per-call tool timeout.
    pub tool_timeout_ms: Option<u64>,
    /// Retry for opening a step's provider stream. Never applied mid-stream.
    pub provider_retry: Option<RetryPolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            buffer: BufferPolicy::default(),
            approval_policy: ApprovalPolicy::default(),
            stream_idle_timeout_ms: DEFAULT_STREAM_IDLE_TIMEOUT_MS,
            tool_timeout_ms: None,
            provider_retry: None,
        }
    }
}

impl EngineConfig {
    /// Defaults, then the default config file if present, then environment.
    pub fn load() -> Result<Self, OutflowError> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, OutflowError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, OutflowError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// `<config dir>/outflow.toml` for the current platform.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "outflow", "outflow")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Apply `OUTFLOW_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a key lookup. Zero and unparsable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read = |key: &str| lookup(key).as_deref().and_then(parse_positive_usize);
        if let Some(value) = read(MAX_STEPS_ENV) {
            self.max_steps = value;
        }
        if let Some(value) = read(MAX_BUFFERED_CHUNKS_ENV) {
            self.buffer.max_buffered_chunks = value;
        }
        if let Some(value) = read(MAX_RETAINED_STEPS_ENV) {
            self.buffer.max_retained_steps = value;
        }
        if let Some(value) = read(STREAM_IDLE_TIMEOUT_ENV) {
            self.stream_idle_timeout_ms = value as u64;
        }
        if let Some(value) = read(TOOL_TIMEOUT_ENV) {
            self.tool_timeout_ms = Some(value as u64);
        }
    }

    pub fn validate(&self) -> Result<(), OutflowError> {
        if self.max_steps == 0 {
            return Err(OutflowError::Configuration(
                "max_steps must be at least 1".into(),
            ));
        }
        if self.buffer.max_buffered_chunks == 0 {
            return Err(OutflowError::Configuration(
                "buffer.max_buffered_chunks must be at least 1".into(),
            ));
        }
        if self.buffer.max_retained_steps == 0 {
            return Err(OutflowError::Configuration(
                "buffer.max_retained_steps must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_positive_usize(value: &str) -> Option<usize> {
    let parsed = value.trim().parse::<usize>().ok()?;
    if parsed == 0 {
        None
    } else {
        Some(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn builder_defaults_match_default() {
        assert_eq!(EngineConfig::builder().build(), EngineConfig::default());
        let config = EngineConfig::builder()
            .max_steps(3)
            .tool_timeout_ms(500)
            .build();
        assert_eq!(config.max_steps, 3);
        assert_eq!(config.tool_timeout_ms, Some(500));
    }

    #[test]
    fn overrides_ignore_zero_and_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("OUTFLOW_MAX_STEPS", "0"),
            ("OUTFLOW_MAX_BUFFERED_CHUNKS", "64"),
            ("OUTFLOW_MAX_RETAINED_STEPS", "lots"),
            ("OUTFLOW_TOOL_TIMEOUT_MS", " 250 "),
        ]);
        let mut config = EngineConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.max_steps, DEFAULT_MAX_STEPS);
        assert_eq!(config.buffer.max_buffered_chunks, 64);
        assert_eq!(config.buffer.max_retained_steps, DEFAULT_MAX_RETAINED_STEPS);
        assert_eq!(config.tool_timeout_ms, Some(250));
    }

    #[test]
    fn toml_fills_missing_fields_with_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
max_steps = 4
approval_policy = "always"

[buffer]
eviction = "oldest_first"
"#,
        )
        .unwrap();
        assert_eq!(config.max_steps, 4);
        assert_eq!(config.approval_policy, ApprovalPolicy::Always);
        assert_eq!(config.buffer.eviction, EvictionStrategy::OldestFirst);
        assert_eq!(config.buffer.max_buffered_chunks, DEFAULT_MAX_BUFFERED_CHUNKS);
    }

    #[test]
    fn toml_rejects_invalid_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("max_steps = 0"),
            Err(OutflowError::Configuration(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("max_steps = \"many\""),
            Err(OutflowError::Toml(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "stream_idle_timeout_ms = 0").unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.stream_idle_timeout_ms, 0);
    }
}
