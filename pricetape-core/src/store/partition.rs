//! Partition file format and the pure merge rule.
//!
//! A partition is one Parquet file with columns
//! `instrument: str, timestamp_ms: i64, price: f64, source: str`,
//! sorted by `(timestamp_ms, instrument)` with that pair unique.

use super::StoreError;
use crate::model::{AnchorRecord, Instrument, SourceTag};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

const COLUMNS: [&str; 4] = ["instrument", "timestamp_ms", "price", "source"];

/// Sidecar describing a committed partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub record_count: usize,
    pub instrument_count: usize,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub content_hash: String,
    pub written_at: DateTime<Utc>,
}

impl PartitionMeta {
    pub fn describe(records: &[AnchorRecord]) -> Self {
        let mut hasher = blake3::Hasher::new();
        let mut instruments: Vec<&str> = Vec::new();
        for r in records {
            hasher.update(r.instrument.as_str().as_bytes());
            hasher.update(&[0]);
            hasher.update(&r.timestamp.timestamp_millis().to_le_bytes());
            hasher.update(&r.price.to_bits().to_le_bytes());
            hasher.update(r.source.as_str().as_bytes());
            instruments.push(r.instrument.as_str());
        }
        instruments.sort_unstable();
        instruments.dedup();

        Self {
            record_count: records.len(),
            instrument_count: instruments.len(),
            first_timestamp: records.first().map(|r| r.timestamp),
            last_timestamp: records.last().map(|r| r.timestamp),
            content_hash: hasher.finalize().to_hex().to_string(),
            written_at: Utc::now(),
        }
    }
}

/// Outcome of folding incoming records into a partition's contents.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedPartition {
    pub records: Vec<AnchorRecord>,
    /// Keys that did not exist before.
    pub added: usize,
    /// Existing keys whose stored record was replaced by a different one.
    pub replaced: usize,
}

impl MergedPartition {
    pub fn changed(&self) -> bool {
        self.added > 0 || self.replaced > 0
    }
}

/// Merge `incoming` into `existing`.
///
/// Conflicts on `(instrument, timestamp)` keep the record with the higher
/// source priority. On equal priority the incoming record wins over the
/// stored one, and a later incoming record wins over an earlier one.
/// Timestamps are truncated to milliseconds, the stored precision.
pub fn merge_records(existing: Vec<AnchorRecord>, incoming: Vec<AnchorRecord>) -> MergedPartition {
    let mut by_key: BTreeMap<(i64, Instrument), AnchorRecord> = BTreeMap::new();
    for record in existing {
        let record = truncate_to_millis(record);
        by_key.insert(
            (record.timestamp.timestamp_millis(), record.instrument.clone()),
            record,
        );
    }
    let stored_keys = by_key.len();

    let mut fresh: BTreeSet<(i64, Instrument)> = BTreeSet::new();
    let mut displaced: BTreeMap<(i64, Instrument), AnchorRecord> = BTreeMap::new();

    for record in incoming {
        let record = truncate_to_millis(record);
        let key = (record.timestamp.timestamp_millis(), record.instrument.clone());
        match by_key.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
                fresh.insert(key);
            }
            Entry::Occupied(mut slot) => {
                if record.source.priority() >= slot.get().source.priority() {
                    if !fresh.contains(&key) {
                        displaced.entry(key).or_insert_with(|| slot.get().clone());
                    }
                    slot.insert(record);
                }
            }
        }
    }

    // Compare against what was stored before this merge, not intermediate winners.
    let replaced = displaced
        .iter()
        .filter(|(key, before)| by_key.get(*key) != Some(*before))
        .count();
    let added = by_key.len() - stored_keys;

    MergedPartition {
        records: by_key.into_values().collect(),
        added,
        replaced,
    }
}

fn truncate_to_millis(mut record: AnchorRecord) -> AnchorRecord {
    let millis = record.timestamp.timestamp_millis();
    if let Some(ts) = DateTime::from_timestamp_millis(millis) {
        record.timestamp = ts;
    }
    record
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn records_to_dataframe(records: &[AnchorRecord]) -> Result<DataFrame, PolarsError> {
    let instruments: Vec<&str> = records.iter().map(|r| r.instrument.as_str()).collect();
    let timestamps: Vec<i64> = records.iter().map(|r| r.timestamp.timestamp_millis()).collect();
    let prices: Vec<f64> = records.iter().map(|r| r.price).collect();
    let sources: Vec<&str> = records.iter().map(|r| r.source.as_str()).collect();

    DataFrame::new(vec![
        Column::new(COLUMNS[0].into(), instruments),
        Column::new(COLUMNS[1].into(), timestamps),
        Column::new(COLUMNS[2].into(), prices),
        Column::new(COLUMNS[3].into(), sources),
    ])
}

/// Write records to `path` as Parquet and flush to disk.
pub fn write_partition_file(path: &Path, records: &[AnchorRecord]) -> Result<(), StoreError> {
    let parquet_err = |e: PolarsError| StoreError::Parquet {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let mut df = records_to_dataframe(records).map_err(parquet_err)?;
    let mut file = fs::File::create(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    ParquetWriter::new(&mut file)
        .finish(&mut df)
        .map_err(parquet_err)?;
    file.sync_all().map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Read and validate a partition file.
pub fn read_partition_file(path: &Path) -> Result<Vec<AnchorRecord>, StoreError> {
    let file = fs::File::open(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("read parquet: {e}"),
        })?;

    dataframe_to_records(&df).map_err(|reason| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    })
}

fn dataframe_to_records(df: &DataFrame) -> Result<Vec<AnchorRecord>, String> {
    for name in COLUMNS {
        if df.column(name).is_err() {
            return Err(format!("missing column '{name}'"));
        }
    }
    let col_err = |e: PolarsError| format!("column type: {e}");

    let instruments = df.column(COLUMNS[0]).map_err(col_err)?.str().map_err(col_err)?;
    let timestamps = df.column(COLUMNS[1]).map_err(col_err)?.i64().map_err(col_err)?;
    let prices = df.column(COLUMNS[2]).map_err(col_err)?.f64().map_err(col_err)?;
    let sources = df.column(COLUMNS[3]).map_err(col_err)?.str().map_err(col_err)?;

    let mut records = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let raw_instrument = instruments
            .get(i)
            .ok_or_else(|| format!("null instrument at row {i}"))?;
        let instrument =
            Instrument::new(raw_instrument).map_err(|e| format!("row {i}: {e}"))?;
        let millis = timestamps
            .get(i)
            .ok_or_else(|| format!("null timestamp at row {i}"))?;
        let timestamp = DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| format!("timestamp out of range at row {i}: {millis}"))?;
        let price = prices.get(i).ok_or_else(|| format!("null price at row {i}"))?;
        let raw_source = sources
            .get(i)
            .ok_or_else(|| format!("null source at row {i}"))?;
        let source = SourceTag::parse(raw_source)
            .ok_or_else(|| format!("unknown source '{raw_source}' at row {i}"))?;

        records.push(AnchorRecord {
            instrument,
            timestamp,
            price,
            source,
        });
    }
    Ok(records)
}
