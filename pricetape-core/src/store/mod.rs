//! Partitioned, append-only, deduplicating anchor store.
//!
//! Layout: `{root}/decade={DDDD}/bucket={B}/{YYYY}.parquet` plus a
//! `{YYYY}.meta.json` sidecar per partition.
//!
//! Merge guarantees:
//! - Writers to the same partition are serialized by an in-process lock;
//!   different partitions merge in parallel.
//! - Every rewrite goes to a uniquely named `.tmp` file in the partition
//!   directory and is renamed into place, so readers and crash recovery
//!   only ever see a complete old or complete new partition.
//! - A partition that fails to load is never overwritten; the failure is
//!   reported and the remaining partitions still commit.
//! - Merging the same records twice leaves the same bytes of content.

pub mod key;
pub mod partition;

pub use key::PartitionKey;
pub use partition::{merge_records, MergedPartition, PartitionMeta};

use crate::atomic::{temp_sibling, write_atomic};
use crate::model::{AnchorRecord, Instrument};
use partition::{read_partition_file, write_partition_file};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Temp files older than this are leftovers from a crashed writer.
const STALE_TEMP_AGE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage root {path} is unavailable: {source}")]
    RootUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("partition {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("parquet error at {path}: {reason}")]
    Parquet { path: PathBuf, reason: String },

    #[error("metadata error at {path}: {reason}")]
    Meta { path: PathBuf, reason: String },
}

/// A partition that could not be committed during a merge.
#[derive(Debug)]
pub struct PartitionFailure {
    pub key: PartitionKey,
    pub error: StoreError,
}

/// Result of a `merge` call.
#[derive(Debug, Default)]
pub struct MergeReport {
    pub records_in: usize,
    /// Partitions rewritten on disk.
    pub partitions_written: usize,
    /// Partitions whose content was already up to date.
    pub partitions_unchanged: usize,
    pub records_added: usize,
    pub records_replaced: usize,
    pub failures: Vec<PartitionFailure>,
}

impl MergeReport {
    pub fn partitions_ok(&self) -> usize {
        self.partitions_written + self.partitions_unchanged
    }

    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Committed partition as seen by `status`.
#[derive(Debug, Clone)]
pub struct PartitionStatus {
    pub key: PartitionKey,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub meta: Option<PartitionMeta>,
}

enum PartitionOutcome {
    Written(MergedPartition),
    Unchanged,
}

pub struct PartitionStore {
    root: PathBuf,
    locks: Mutex<HashMap<PartitionKey, Arc<Mutex<()>>>>,
}

impl PartitionStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::RootUnavailable {
            path: root.clone(),
            source,
        })?;

        let store = Self {
            root,
            locks: Mutex::new(HashMap::new()),
        };

        match store.sweep_temp_files(STALE_TEMP_AGE) {
            Ok(0) => {}
            Ok(n) => tracing::info!(removed = n, "removed stale partition temp files"),
            Err(e) => tracing::warn!(error = %e, "could not sweep partition temp files"),
        }

        Ok(store)
    }

    /// Open an existing store for reading. Nothing is created or swept, and
    /// a missing root is `RootUnavailable`.
    pub fn open_existing(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        };
        store.check_root()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(&self, key: &PartitionKey) -> PathBuf {
        self.root.join(key.relative_dir()).join(key.file_name())
    }

    fn meta_path(&self, key: &PartitionKey) -> PathBuf {
        self.root.join(key.relative_dir()).join(key.meta_file_name())
    }

    fn lock_for(&self, key: PartitionKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key).or_default())
    }

    /// Group `records` by partition and merge each group into its partition.
    ///
    /// Only an unusable storage root fails the whole call; per-partition
    /// failures are collected in the report.
    pub fn merge(&self, records: Vec<AnchorRecord>) -> Result<MergeReport, StoreError> {
        self.check_root()?;

        let records_in = records.len();
        let mut groups: BTreeMap<PartitionKey, Vec<AnchorRecord>> = BTreeMap::new();
        for record in records {
            groups
                .entry(PartitionKey::for_record(&record))
                .or_default()
                .push(record);
        }

        let outcomes: Vec<(PartitionKey, Result<PartitionOutcome, StoreError>)> = groups
            .into_par_iter()
            .map(|(key, group)| (key, self.merge_partition(key, group)))
            .collect();

        let mut report = MergeReport {
            records_in,
            ..MergeReport::default()
        };
        for (key, outcome) in outcomes {
            match outcome {
                Ok(PartitionOutcome::Written(merged)) => {
                    report.partitions_written += 1;
                    report.records_added += merged.added;
                    report.records_replaced += merged.replaced;
                }
                Ok(PartitionOutcome::Unchanged) => report.partitions_unchanged += 1,
                Err(error) => {
                    tracing::warn!(partition = %key, error = %error, "partition merge failed");
                    report.failures.push(PartitionFailure { key, error });
                }
            }
        }

        tracing::debug!(
            records = report.records_in,
            written = report.partitions_written,
            unchanged = report.partitions_unchanged,
            failed = report.failures.len(),
            "merge complete"
        );
        Ok(report)
    }

    /// Fail with `RootUnavailable` unless the root is an accessible directory.
    pub fn check_root(&self) -> Result<(), StoreError> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StoreError::RootUnavailable {
                path: self.root.clone(),
                source: io::Error::new(io::ErrorKind::Other, "not a directory"),
            }),
            Err(source) => Err(StoreError::RootUnavailable {
                path: self.root.clone(),
                source,
            }),
        }
    }

    fn merge_partition(
        &self,
        key: PartitionKey,
        incoming: Vec<AnchorRecord>,
    ) -> Result<PartitionOutcome, StoreError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let path = self.partition_path(&key);
        let existed = path.exists();
        let existing = if existed {
            read_partition_file(&path)?
        } else {
            Vec::new()
        };

        let merged = merge_records(existing, incoming);
        if existed && !merged.changed() {
            return Ok(PartitionOutcome::Unchanged);
        }

        let dir = self.root.join(key.relative_dir());
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let tmp = temp_sibling(&path);
        if let Err(e) = write_partition_file(&tmp, &merged.records) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, &path).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            StoreError::Io {
                path: path.clone(),
                source,
            }
        })?;

        // Sidecar is informational; the partition is already committed.
        if let Err(e) = self.write_meta(&key, &PartitionMeta::describe(&merged.records)) {
            tracing::warn!(partition = %key, error = %e, "failed to write partition metadata");
        }

        Ok(PartitionOutcome::Written(merged))
    }

    fn write_meta(&self, key: &PartitionKey, meta: &PartitionMeta) -> Result<(), StoreError> {
        let path = self.meta_path(key);
        let json = serde_json::to_string_pretty(meta).map_err(|e| StoreError::Meta {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&path, json.as_bytes()).map_err(|source| StoreError::Io { path, source })
    }

    /// Read one partition. An absent partition is empty.
    pub fn read_partition(&self, key: &PartitionKey) -> Result<Vec<AnchorRecord>, StoreError> {
        let path = self.partition_path(key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let lock = self.lock_for(*key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        read_partition_file(&path)
    }

    /// All records for one instrument across `years`, in timestamp order.
    pub fn read_instrument(
        &self,
        instrument: &Instrument,
        years: RangeInclusive<i32>,
    ) -> Result<Vec<AnchorRecord>, StoreError> {
        let mut out = Vec::new();
        for year in years {
            let key = PartitionKey::new(instrument, year);
            out.extend(
                self.read_partition(&key)?
                    .into_iter()
                    .filter(|r| &r.instrument == instrument),
            );
        }
        Ok(out)
    }

    /// Committed partitions, sorted by key.
    pub fn list_partitions(&self) -> Result<Vec<PartitionKey>, StoreError> {
        let mut keys: Vec<PartitionKey> = self
            .partition_files()?
            .iter()
            .filter_map(|path| {
                let rel = path.strip_prefix(&self.root).ok()?;
                PartitionKey::from_relative_path(rel)
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    pub fn status(&self) -> Result<Vec<PartitionStatus>, StoreError> {
        self.list_partitions()?
            .into_iter()
            .map(|key| {
                let path = self.partition_path(&key);
                let size_bytes = fs::metadata(&path)
                    .map_err(|source| StoreError::Io {
                        path: path.clone(),
                        source,
                    })?
                    .len();
                let meta = fs::read_to_string(self.meta_path(&key))
                    .ok()
                    .and_then(|s| serde_json::from_str(&s).ok());
                Ok(PartitionStatus {
                    key,
                    path,
                    size_bytes,
                    meta,
                })
            })
            .collect()
    }

    /// Remove `*.tmp` files older than `min_age` left behind by crashed writers.
    pub fn sweep_temp_files(&self, min_age: Duration) -> Result<usize, StoreError> {
        let mut removed = 0;
        for path in walk_files(&self.root)? {
            let is_tmp = path.extension().and_then(|e| e.to_str()) == Some("tmp");
            if !is_tmp {
                continue;
            }
            let old_enough = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .is_some_and(|age| age >= min_age);
            if old_enough && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn partition_files(&self) -> Result<Vec<PathBuf>, StoreError> {
        Ok(walk_files(&self.root)?
            .into_iter()
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("parquet"))
            .collect())
    }
}

fn walk_files(root: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceTag;
    use chrono::{TimeZone, Utc};

    fn rec(inst: &str, y: i32, m: u32, d: u32, price: f64) -> AnchorRecord {
        AnchorRecord {
            instrument: Instrument::new(inst).unwrap(),
            timestamp: Utc.with_ymd_and_hms(y, m, d, 15, 30, 0).unwrap(),
            price,
            source: SourceTag::Live,
        }
    }

    #[test]
    fn merge_groups_by_bucket_and_year() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::open(dir.path()).unwrap();

        let report = store
            .merge(vec![
                rec("AAPL", 2024, 1, 2, 180.0),
                rec("AMZN", 2024, 1, 2, 150.0),
                rec("AAPL", 2023, 12, 29, 190.0),
                rec("MSFT", 2024, 1, 2, 370.0),
            ])
            .unwrap();

        assert!(report.all_succeeded());
        assert_eq!(report.partitions_written, 3);
        assert_eq!(report.records_added, 4);

        let keys: Vec<String> = store.list_partitions().unwrap().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["A/2023", "A/2024", "M/2024"]);

        let a2024 = store
            .read_partition(&PartitionKey::new(&Instrument::new("A").unwrap(), 2024))
            .unwrap();
        assert_eq!(a2024.len(), 2);
    }

    #[test]
    fn second_identical_merge_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::open(dir.path()).unwrap();
        let batch = vec![rec("AAPL", 2024, 1, 2, 180.0), rec("AAPL", 2024, 1, 3, 181.0)];

        store.merge(batch.clone()).unwrap();
        let key = PartitionKey::new(&Instrument::new("AAPL").unwrap(), 2024);
        let first = store.read_partition(&key).unwrap();

        let report = store.merge(batch).unwrap();
        assert_eq!(report.partitions_written, 0);
        assert_eq!(report.partitions_unchanged, 1);
        assert_eq!(store.read_partition(&key).unwrap(), first);
    }

    #[test]
    fn corrupt_partition_is_reported_and_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::open(dir.path()).unwrap();

        let bad_key = PartitionKey::new(&Instrument::new("BAD").unwrap(), 2024);
        let bad_path = store.partition_path(&bad_key);
        fs::create_dir_all(bad_path.parent().unwrap()).unwrap();
        fs::write(&bad_path, b"garbage").unwrap();

        let report = store
            .merge(vec![rec("BAD", 2024, 5, 1, 1.0), rec("GOOD", 2024, 5, 1, 2.0)])
            .unwrap();

        assert_eq!(report.partitions_written, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, bad_key);
        assert!(matches!(report.failures[0].error, StoreError::Corrupt { .. }));
        assert_eq!(fs::read(&bad_path).unwrap(), b"garbage");

        let good = store
            .read_instrument(&Instrument::new("GOOD").unwrap(), 2024..=2024)
            .unwrap();
        assert_eq!(good.len(), 1);
    }

    #[test]
    fn read_instrument_filters_bucket_neighbours() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::open(dir.path()).unwrap();
        store
            .merge(vec![
                rec("AAPL", 2023, 6, 1, 1.0),
                rec("AMD", 2023, 6, 1, 2.0),
                rec("AAPL", 2024, 6, 1, 3.0),
            ])
            .unwrap();

        let aapl = store
            .read_instrument(&Instrument::new("AAPL").unwrap(), 2022..=2025)
            .unwrap();
        let prices: Vec<f64> = aapl.iter().map(|r| r.price).collect();
        assert_eq!(prices, vec![1.0, 3.0]);
    }

    #[test]
    fn status_reports_meta() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::open(dir.path()).unwrap();
        store
            .merge(vec![rec("ZZ", 2024, 1, 1, 1.0), rec("ZY", 2024, 1, 2, 2.0)])
            .unwrap();

        let status = store.status().unwrap();
        assert_eq!(status.len(), 1);
        let meta = status[0].meta.as_ref().unwrap();
        assert_eq!(meta.record_count, 2);
        assert_eq!(meta.instrument_count, 2);
        assert!(status[0].size_bytes > 0);
    }

    #[test]
    fn sweep_removes_only_old_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::open(dir.path()).unwrap();
        let nested = dir.path().join("decade=2020/bucket=A");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("2024.parquet.1-0.tmp"), b"partial").unwrap();
        fs::write(nested.join("2024.meta.json"), b"{}").unwrap();

        assert_eq!(store.sweep_temp_files(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(store.sweep_temp_files(Duration::ZERO).unwrap(), 1);
        assert!(nested.join("2024.meta.json").exists());
    }

    #[test]
    fn open_existing_neither_creates_nor_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("typo");
        assert!(matches!(
            PartitionStore::open_existing(&missing),
            Err(StoreError::RootUnavailable { .. })
        ));
        assert!(!missing.exists());

        let nested = dir.path().join("decade=2020/bucket=A");
        fs::create_dir_all(&nested).unwrap();
        let leftover = nested.join("2024.parquet.1-0.tmp");
        fs::write(&leftover, b"partial").unwrap();
        let an_hour_ago = std::time::SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&leftover)
            .unwrap()
            .set_modified(an_hour_ago)
            .unwrap();

        let store = PartitionStore::open_existing(dir.path()).unwrap();
        assert!(store.list_partitions().unwrap().is_empty());
        assert!(leftover.exists());

        PartitionStore::open(dir.path()).unwrap();
        assert!(!leftover.exists());
    }

    #[test]
    fn root_that_is_a_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            PartitionStore::open(&file),
            Err(StoreError::RootUnavailable { .. })
        ));
    }
}
