//! pricetape runner: configuration, request pacing, the fetch orchestrator
//! and the cycle-driving collector.
//!
//! Builds on `pricetape-core`:
//! - `config` loads and validates the collector TOML
//! - `pacing` holds the shared request gate and the backoff policy
//! - `orchestrator` fans one cycle out over a bounded worker pool
//! - `collector` ties pool, orchestrator, store and snapshot together

pub mod collector;
pub mod config;
pub mod orchestrator;
pub mod pacing;

pub use collector::{Collector, CollectorError, CycleError, CycleReport, RunSummary};
pub use config::{CollectorConfig, ConfigError, SourceKind};
pub use orchestrator::{
    fetch_with_timeout, CycleOutcome, CycleSummary, FetchConfig, InstrumentFailure, Orchestrator,
};
pub use pacing::{BackoffPolicy, RequestPacer};
