//! CSV replay source: serves recorded samples from `{dir}/{INSTRUMENT}.csv`.
//!
//! Each file has a `timestamp,price` header. Timestamps are either RFC 3339
//! strings or integer epoch milliseconds. Only rows inside the requested
//! window are returned. Useful offline and for reproducing a session.

use super::{SampleSource, SourceError};
use crate::model::{FetchWindow, Instrument, RawSample, SourceTag};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct ReplayRow {
    timestamp: String,
    price: f64,
}

pub struct CsvReplaySource {
    dir: PathBuf,
}

impl CsvReplaySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, instrument: &Instrument) -> PathBuf {
        self.dir.join(format!("{instrument}.csv"))
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SourceError> {
    let raw = raw.trim();
    if let Ok(millis) = raw.parse::<i64>() {
        return DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| SourceError::Malformed(format!("epoch millis out of range: {raw}")));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SourceError::Malformed(format!("bad timestamp '{raw}': {e}")))
}

impl SampleSource for CsvReplaySource {
    fn name(&self) -> &str {
        "csv_replay"
    }

    fn tag(&self) -> SourceTag {
        SourceTag::Replay
    }

    fn fetch(
        &self,
        instrument: &Instrument,
        window: &FetchWindow,
    ) -> Result<Vec<RawSample>, SourceError> {
        let path = self.file_for(instrument);
        if !path.exists() {
            return Err(SourceError::NotFound {
                instrument: instrument.clone(),
            });
        }

        let mut reader = csv::Reader::from_path(&path)
            .map_err(|e| SourceError::Malformed(format!("{}: {e}", path.display())))?;

        let mut samples = Vec::new();
        for (line, row) in reader.deserialize::<ReplayRow>().enumerate() {
            let row = row.map_err(|e| {
                SourceError::Malformed(format!("{} row {}: {e}", path.display(), line + 1))
            })?;
            let timestamp = parse_timestamp(&row.timestamp)?;
            if window.contains(timestamp) {
                samples.push(RawSample {
                    instrument: instrument.clone(),
                    timestamp,
                    price: row.price,
                });
            }
        }

        Ok(samples)
    }
}
