//! Cycle driver: pool → orchestrator → store → snapshot.
//!
//! A cycle is fatal only when no work is possible at all (the pool cannot be
//! loaded or the storage root is gone). Per-instrument and per-partition
//! failures end up in the `CycleReport`.
//!
//! Anchors that were accepted by the compressor but whose partition failed
//! to commit are rolled back, so the next cycle accepts them again instead of
//! silently losing the records.

use crate::config::{CollectorConfig, SourceKind};
use crate::orchestrator::{CycleSummary, InstrumentFailure, Orchestrator, OrchestratorError};
use crate::pacing::sleep_until;
use chrono::{DateTime, Utc};
use pricetape_core::compressor::{AnchorCompressor, AnchorState, CompressorError};
use pricetape_core::model::{AnchorRecord, FetchWindow, Instrument};
use pricetape_core::pool::{InstrumentPool, PoolError, TomlPool};
use pricetape_core::source::{CsvReplaySource, SampleSource, SourceError, YahooSource};
use pricetape_core::state::StateSnapshot;
use pricetape_core::store::{MergeReport, PartitionKey, PartitionStore, StoreError};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors that prevent a collector from being built.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error(transparent)]
    Compressor(#[from] CompressorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("failed to create sample source: {0}")]
    Source(#[from] SourceError),

    #[error("source.kind = \"csv\" requires source.csv_dir")]
    MissingCsvDir,
}

/// Errors that abort a single cycle. The caller retries on the next interval.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("failed to load instrument pool: {0}")]
    Pool(#[from] PoolError),

    #[error("storage unavailable: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub pool_size: usize,
    pub fetch: CycleSummary,
    pub failures: Vec<InstrumentFailure>,
    pub merge: MergeReport,
    /// Instruments whose anchors were rolled back after a failed partition.
    pub rolled_back: usize,
    pub snapshot_saved: bool,
}

/// Totals for a `run` loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub fatal_errors: u64,
    pub anchors_written: usize,
}

pub struct Collector {
    pool: Box<dyn InstrumentPool>,
    compressor: Arc<AnchorCompressor>,
    orchestrator: Orchestrator,
    store: PartitionStore,
    snapshot_path: PathBuf,
    lookback: chrono::Duration,
    cycles_run: u64,
}

impl Collector {
    /// Build a collector around an explicit pool and source.
    pub fn new(
        config: &CollectorConfig,
        pool: Box<dyn InstrumentPool>,
        source: Arc<dyn SampleSource>,
    ) -> Result<Self, CollectorError> {
        let compressor = Arc::new(
            restore_compressor(&config.storage.snapshot_path, config.compressor.threshold)?
                .with_stale_guard(config.compressor.skip_stale),
        );
        let store = PartitionStore::open(&config.storage.root)?;
        let orchestrator = Orchestrator::new(
            source,
            Arc::clone(&compressor),
            config.fetch_config(),
            config.backoff_policy(),
        )?;

        Ok(Self {
            pool,
            compressor,
            orchestrator,
            store,
            snapshot_path: config.storage.snapshot_path.clone(),
            lookback: config.lookback(),
            cycles_run: 0,
        })
    }

    /// Build everything from configuration: TOML pool file and the
    /// configured source.
    pub fn from_config(config: &CollectorConfig) -> Result<Self, CollectorError> {
        let pool = TomlPool::open(&config.pool.path)?;
        let source = build_source(config)?;
        Self::new(config, Box::new(pool), source)
    }

    pub fn compressor(&self) -> &AnchorCompressor {
        &self.compressor
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles_run
    }

    /// Run one cycle.
    pub fn run_cycle(&mut self, stop: Option<&AtomicBool>) -> Result<CycleReport, CycleError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        self.cycles_run += 1;
        let cycle = self.cycles_run;

        let instruments: Vec<Instrument> = self.pool.load()?.into_iter().collect();
        self.store.check_root()?;

        let before = self.compressor.anchors();
        let window = FetchWindow::trailing(self.lookback);
        let outcome = self.orchestrator.run_cycle(&instruments, &window, stop);

        let touched: BTreeSet<Instrument> =
            outcome.records.iter().map(|r| r.instrument.clone()).collect();
        let records_by_key = partition_instruments(&outcome.records);

        let merge = match self.store.merge(outcome.records) {
            Ok(merge) => merge,
            Err(e) => {
                self.roll_back(touched.iter(), &before);
                return Err(e.into());
            }
        };

        let failed: BTreeSet<&Instrument> = merge
            .failures
            .iter()
            .filter_map(|f| records_by_key.get(&f.key))
            .flatten()
            .collect();
        let rolled_back = failed.len();
        if rolled_back > 0 {
            tracing::warn!(instruments = rolled_back, "rolling back anchors for uncommitted partitions");
            self.roll_back(failed.into_iter(), &before);
        }

        let snapshot_saved = match StateSnapshot::new(self.compressor.anchors())
            .and_then(|snapshot| snapshot.save(&self.snapshot_path))
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "failed to save compressor snapshot");
                false
            }
        };

        let report = CycleReport {
            cycle,
            started_at,
            elapsed: clock.elapsed(),
            pool_size: instruments.len(),
            fetch: outcome.summary,
            failures: outcome.failures,
            merge,
            rolled_back,
            snapshot_saved,
        };
        log_report(&report);
        Ok(report)
    }

    /// Run cycles every `interval` until `stop` is raised or `max_cycles`
    /// have run. Fatal cycle errors are logged and retried next interval.
    pub fn run(&mut self, stop: &AtomicBool, interval: Duration, max_cycles: Option<u64>) -> RunSummary {
        let mut summary = RunSummary::default();

        loop {
            if stop.load(Ordering::Relaxed) {
                tracing::info!("stop requested");
                break;
            }
            if max_cycles.is_some_and(|max| summary.cycles >= max) {
                break;
            }

            let deadline = Instant::now() + interval;
            match self.run_cycle(Some(stop)) {
                Ok(report) => summary.anchors_written += report.merge.records_added,
                Err(e) => {
                    summary.fatal_errors += 1;
                    tracing::error!(error = %e, "cycle failed, retrying next interval");
                }
            }
            summary.cycles += 1;

            if max_cycles.is_some_and(|max| summary.cycles >= max) {
                break;
            }
            if !sleep_until(deadline, Some(stop)) {
                tracing::info!("stop requested");
                break;
            }
        }

        tracing::info!(
            cycles = summary.cycles,
            fatal_errors = summary.fatal_errors,
            anchors_written = summary.anchors_written,
            "collector stopped"
        );
        summary
    }

    fn roll_back<'a>(
        &self,
        instruments: impl Iterator<Item = &'a Instrument>,
        before: &BTreeMap<Instrument, AnchorState>,
    ) {
        for instrument in instruments {
            self.compressor.restore(instrument, before.get(instrument).copied());
        }
    }
}

/// Load the snapshot into a compressor. A missing snapshot starts empty; an
/// unusable one is quarantined and also starts empty.
pub fn restore_compressor(path: &Path, threshold: f64) -> Result<AnchorCompressor, CompressorError> {
    match StateSnapshot::load(path) {
        Ok(Some(snapshot)) => {
            tracing::info!(
                path = %path.display(),
                anchors = snapshot.anchors.len(),
                saved_at = %snapshot.saved_at,
                "restored compressor snapshot"
            );
            AnchorCompressor::from_anchors(threshold, snapshot.anchors)
        }
        Ok(None) => {
            tracing::info!(path = %path.display(), "no compressor snapshot, starting empty");
            AnchorCompressor::new(threshold)
        }
        Err(e) => {
            tracing::warn!(error = %e, "compressor snapshot unusable, starting empty");
            match StateSnapshot::quarantine(path) {
                Ok(moved) => tracing::warn!(to = %moved.display(), "quarantined snapshot"),
                Err(qe) => tracing::warn!(error = %qe, "could not quarantine snapshot"),
            }
            AnchorCompressor::new(threshold)
        }
    }
}

/// Construct the sample source named by `config.source`.
pub fn build_source(config: &CollectorConfig) -> Result<Arc<dyn SampleSource>, CollectorError> {
    match config.source.kind {
        SourceKind::Yahoo => Ok(Arc::new(YahooSource::new(config.fetch_timeout())?)),
        SourceKind::Csv => {
            let dir = config.source.csv_dir.as_ref().ok_or(CollectorError::MissingCsvDir)?;
            Ok(Arc::new(CsvReplaySource::new(dir)))
        }
    }
}

fn partition_instruments(records: &[AnchorRecord]) -> BTreeMap<PartitionKey, BTreeSet<Instrument>> {
    let mut map: BTreeMap<PartitionKey, BTreeSet<Instrument>> = BTreeMap::new();
    for record in records {
        map.entry(PartitionKey::for_record(record))
            .or_default()
            .insert(record.instrument.clone());
    }
    map
}

fn log_report(report: &CycleReport) {
    let fetch = &report.fetch;
    tracing::info!(
        cycle = report.cycle,
        pool = report.pool_size,
        attempted = fetch.attempted,
        succeeded = fetch.succeeded,
        failed = fetch.failed,
        skipped = fetch.skipped,
        samples = fetch.samples,
        anchors = fetch.anchors,
        rate_limited = fetch.rate_limited,
        partitions_written = report.merge.partitions_written,
        partition_failures = report.merge.failures.len(),
        records_added = report.merge.records_added,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "cycle complete"
    );
    for failure in &report.failures {
        tracing::debug!(instrument = %failure.instrument, error = %failure.error, "instrument failed this cycle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config_in(dir: &Path) -> CollectorConfig {
        let mut config = CollectorConfig::default();
        config.storage.root = dir.join("anchors");
        config.storage.snapshot_path = dir.join("state.json");
        config
    }

    #[test]
    fn corrupt_snapshot_is_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{ not json").unwrap();

        let compressor = restore_compressor(&path, 0.01).unwrap();
        assert!(compressor.is_empty());
        assert!(!path.exists());
        assert!(dir.path().join("state.json.quarantined").exists());
    }

    #[test]
    fn csv_source_requires_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.source.kind = SourceKind::Csv;
        assert!(matches!(build_source(&config), Err(CollectorError::MissingCsvDir)));

        config.source.csv_dir = Some(dir.path().to_path_buf());
        assert!(build_source(&config).is_ok());
    }
}
