//! Collector configuration loaded from a TOML file.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration. `validate()` runs after every load.

use crate::orchestrator::FetchConfig;
use crate::pacing::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub storage: StorageConfig,
    pub compressor: CompressorConfig,
    pub fetch: FetchSection,
    pub backoff: BackoffSection,
    pub schedule: ScheduleConfig,
    pub pool: PoolConfig,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Partition store root.
    pub root: PathBuf,
    /// Compressor snapshot file.
    pub snapshot_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/anchors"),
            snapshot_path: PathBuf::from("data/compressor_state.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorConfig {
    /// Relative deviation from the last anchor needed to record a new one.
    pub threshold: f64,
    /// Drop samples not newer than the last anchor.
    pub skip_stale: bool,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.0005,
            skip_stale: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub max_workers: usize,
    pub batch_size: usize,
    pub timeout_ms: u64,
    pub min_spacing_ms: u64,
    pub jitter_ms: u64,
    pub lookback_minutes: i64,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            max_workers: 32,
            batch_size: 500,
            timeout_ms: 8_000,
            min_spacing_ms: 50,
            jitter_ms: 150,
            lookback_minutes: 1_440,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_ms: 2_000,
            max_ms: 60_000,
            multiplier: 2.0,
            jitter_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    /// Stop after this many cycles. Unbounded when absent.
    pub max_cycles: Option<u64>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_cycles: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub path: PathBuf,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pool.toml"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Yahoo,
    Csv,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Directory of `{INSTRUMENT}.csv` files, required for `kind = "csv"`.
    pub csv_dir: Option<PathBuf>,
}

impl CollectorConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.compressor.threshold;
        if !t.is_finite() || t <= 0.0 || t >= 1.0 {
            return Err(invalid("compressor.threshold", format!("must be in (0, 1), got {t}")));
        }
        if self.fetch.max_workers == 0 {
            return Err(invalid("fetch.max_workers", "must be at least 1"));
        }
        if self.fetch.batch_size == 0 {
            return Err(invalid("fetch.batch_size", "must be at least 1"));
        }
        if self.fetch.timeout_ms == 0 {
            return Err(invalid("fetch.timeout_ms", "must be positive"));
        }
        if self.fetch.lookback_minutes <= 0 {
            return Err(invalid("fetch.lookback_minutes", "must be positive"));
        }
        let m = self.backoff.multiplier;
        if !m.is_finite() || m < 1.0 {
            return Err(invalid("backoff.multiplier", format!("must be >= 1, got {m}")));
        }
        if self.backoff.max_ms < self.backoff.base_ms {
            return Err(invalid("backoff.max_ms", "must be >= backoff.base_ms"));
        }
        if self.schedule.interval_secs == 0 {
            return Err(invalid("schedule.interval_secs", "must be positive"));
        }
        if self.source.kind == SourceKind::Csv && self.source.csv_dir.is_none() {
            return Err(invalid("source.csv_dir", "is required when source.kind = \"csv\""));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch.timeout_ms)
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.fetch.lookback_minutes)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.schedule.interval_secs)
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            max_workers: self.fetch.max_workers,
            batch_size: self.fetch.batch_size,
            timeout: self.fetch_timeout(),
            min_spacing: Duration::from_millis(self.fetch.min_spacing_ms),
            jitter: Duration::from_millis(self.fetch.jitter_ms),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff.base_ms),
            max: Duration::from_millis(self.backoff.max_ms),
            multiplier: self.backoff.multiplier,
            jitter: Duration::from_millis(self.backoff.jitter_ms),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = CollectorConfig::from_toml("").unwrap();
        assert_eq!(config, CollectorConfig::default());
        assert_eq!(config.fetch.max_workers, 32);
        assert_eq!(config.compressor.threshold, 0.0005);
        assert_eq!(config.source.kind, SourceKind::Yahoo);
    }

    #[test]
    fn partial_sections_fill_in() {
        let config = CollectorConfig::from_toml(
            r#"
[storage]
root = "/var/lib/pricetape"

[fetch]
max_workers = 8

[source]
kind = "csv"
csv_dir = "replay"
"#,
        )
        .unwrap();
        assert_eq!(config.storage.root, PathBuf::from("/var/lib/pricetape"));
        assert_eq!(config.storage.snapshot_path, PathBuf::from("data/compressor_state.json"));
        assert_eq!(config.fetch.max_workers, 8);
        assert_eq!(config.fetch.batch_size, 500);
        assert_eq!(config.source.kind, SourceKind::Csv);
    }

    #[test]
    fn rejects_bad_values() {
        for (toml, field) in [
            ("[compressor]\nthreshold = 0.0", "compressor.threshold"),
            ("[compressor]\nthreshold = 1.5", "compressor.threshold"),
            ("[fetch]\nmax_workers = 0", "fetch.max_workers"),
            ("[backoff]\nmultiplier = 0.5", "backoff.multiplier"),
            ("[backoff]\nbase_ms = 10\nmax_ms = 5", "backoff.max_ms"),
            ("[source]\nkind = \"csv\"", "source.csv_dir"),
        ] {
            match CollectorConfig::from_toml(toml) {
                Err(ConfigError::Invalid { field: f, .. }) => assert_eq!(f, field, "{toml}"),
                other => panic!("{toml}: expected Invalid, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_source_kind_is_parse_error() {
        assert!(matches!(
            CollectorConfig::from_toml("[source]\nkind = \"bloomberg\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn to_toml_roundtrips() {
        let mut config = CollectorConfig::default();
        config.schedule.max_cycles = Some(3);
        let text = config.to_toml().unwrap();
        assert_eq!(CollectorConfig::from_toml(&text).unwrap(), config);
    }
}
