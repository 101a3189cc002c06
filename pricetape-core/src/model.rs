//! Core data model: instruments, raw samples, anchor records, fetch windows.
//!
//! `RawSample` is transient (source → compressor). `AnchorRecord` is the unit
//! of persistence and the only thing the partition store ever sees.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Rejected instrument identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstrumentError {
    #[error("instrument identifier is empty")]
    Empty,

    #[error("instrument identifier '{0}' contains whitespace or a path separator")]
    IllegalCharacter(String),
}

/// Opaque, case-normalized instrument identifier (e.g. an exchange ticker).
///
/// Normalization trims surrounding whitespace and upper-cases, so `" aapl"`
/// and `"AAPL"` are the same pool member.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Instrument(String);

impl Instrument {
    pub fn new(raw: &str) -> Result<Self, InstrumentError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InstrumentError::Empty);
        }
        if trimmed
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '\\')
        {
            return Err(InstrumentError::IllegalCharacter(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Instrument {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Instrument {
    type Error = InstrumentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Instrument> for String {
    fn from(value: Instrument) -> Self {
        value.0
    }
}

/// A single price observation returned by a sample source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub instrument: Instrument,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

/// Where an anchor's price came from.
///
/// Priority decides which record survives when two records share an
/// `(instrument, timestamp)` key during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    Replay,
    Intraday,
    Live,
    Manual,
}

impl SourceTag {
    pub fn priority(self) -> u8 {
        match self {
            SourceTag::Replay => 0,
            SourceTag::Intraday => 1,
            SourceTag::Live => 2,
            SourceTag::Manual => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceTag::Replay => "replay",
            SourceTag::Intraday => "intraday",
            SourceTag::Live => "live",
            SourceTag::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "replay" => Some(SourceTag::Replay),
            "intraday" => Some(SourceTag::Intraday),
            "live" => Some(SourceTag::Live),
            "manual" => Some(SourceTag::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted, economically significant price change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub instrument: Instrument,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub source: SourceTag,
}

/// Time range a source is asked to cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    /// Window ending now and reaching back `lookback`.
    pub fn trailing(lookback: Duration) -> Self {
        let end = Utc::now();
        Self {
            start: end - lookback,
            end,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}
