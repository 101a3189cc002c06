//! Deterministic partition keys and their on-disk paths.
//!
//! `key(instrument, year)` depends only on the first character of the
//! normalized identifier and the calendar year (UTC), so it is stable across
//! restarts and machines.
//!
//! Layout: `decade={DDDD}/bucket={B}/{YYYY}.parquet`

use crate::model::{AnchorRecord, Instrument};
use chrono::Datelike;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    pub bucket: char,
    pub year: i32,
}

impl PartitionKey {
    pub fn new(instrument: &Instrument, year: i32) -> Self {
        Self {
            bucket: bucket_of(instrument),
            year,
        }
    }

    pub fn for_record(record: &AnchorRecord) -> Self {
        Self::new(&record.instrument, record.timestamp.year())
    }

    pub fn decade(&self) -> i32 {
        self.year - self.year.rem_euclid(10)
    }

    /// Directory holding this partition, relative to the store root.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(format!("decade={}", self.decade())).join(format!("bucket={}", self.bucket))
    }

    pub fn file_name(&self) -> String {
        format!("{}.parquet", self.year)
    }

    pub fn meta_file_name(&self) -> String {
        format!("{}.meta.json", self.year)
    }

    /// Recover a key from a `decade=…/bucket=…/YYYY.parquet` path.
    pub fn from_relative_path(path: &Path) -> Option<Self> {
        let mut parts = path.iter().map(|p| p.to_str());
        let decade: i32 = parts.next()??.strip_prefix("decade=")?.parse().ok()?;
        let bucket_part = parts.next()??.strip_prefix("bucket=")?;
        let file = parts.next()??;
        if parts.next().is_some() {
            return None;
        }

        let mut chars = bucket_part.chars();
        let bucket = chars.next()?;
        if chars.next().is_some() {
            return None;
        }

        let year: i32 = file.strip_suffix(".parquet")?.parse().ok()?;
        let key = Self { bucket, year };
        (key.decade() == decade).then_some(key)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.year)
    }
}

/// First ASCII alphanumeric character, upper-cased; `_` for anything else
/// (index symbols like `^GSPC`, non-ASCII identifiers).
fn bucket_of(instrument: &Instrument) -> char {
    match instrument.as_str().chars().next() {
        Some(c) if c.is_ascii_alphanumeric() => c.to_ascii_uppercase(),
        _ => '_',
    }
}
