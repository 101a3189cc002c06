//! Sample source trait and structured error types.
//!
//! A `SampleSource` turns an instrument and a time window into raw price
//! samples. The orchestrator owns retry and pacing policy; sources make one
//! attempt per call and report what went wrong.

pub mod replay;
pub mod yahoo;

use crate::model::{FetchWindow, Instrument, RawSample, SourceTag};
use std::time::Duration;
use thiserror::Error;

pub use replay::CsvReplaySource;
pub use yahoo::YahooSource;

/// Per-instrument fetch failure. Never fatal to a cycle.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("fetch timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    #[error("rate limited by source{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("source refused the request (blocked)")]
    Blocked,

    #[error("instrument not found: {instrument}")]
    NotFound { instrument: Instrument },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("network error: {0}")]
    Network(String),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

impl SourceError {
    /// True for the explicit "slow down" signals (429 / 403 equivalents).
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, SourceError::RateLimited { .. } | SourceError::Blocked)
    }

    /// Server-suggested wait, if the source supplied one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// A provider of raw price samples.
///
/// Implementations must be shareable across worker threads; the orchestrator
/// calls `fetch` concurrently for different instruments.
pub trait SampleSource: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Tag stamped on every anchor produced from this source's samples.
    fn tag(&self) -> SourceTag;

    /// Fetch samples for one instrument. Order of the returned samples is not
    /// significant; the orchestrator sorts them chronologically.
    fn fetch(&self, instrument: &Instrument, window: &FetchWindow)
        -> Result<Vec<RawSample>, SourceError>;
}
