//! Fetch orchestrator: one bounded-concurrency pass over an instrument set.
//!
//! Instruments are processed in fixed-size batches on a private rayon pool
//! sized to `max_workers`; a batch finishes before the next one starts. Each
//! task paces itself through the shared `RequestPacer`, fetches with a hard
//! timeout, and feeds the samples to the compressor in timestamp order.
//! Source failures stay inside the task and are reported per instrument.

use crate::pacing::{BackoffPolicy, RequestPacer};
use pricetape_core::compressor::AnchorCompressor;
use pricetape_core::model::{AnchorRecord, FetchWindow, Instrument, RawSample};
use pricetape_core::source::{SampleSource, SourceError};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to build fetch worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchConfig {
    pub max_workers: usize,
    pub batch_size: usize,
    pub timeout: Duration,
    pub min_spacing: Duration,
    pub jitter: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_workers: 32,
            batch_size: 500,
            timeout: Duration::from_secs(8),
            min_spacing: Duration::from_millis(50),
            jitter: Duration::from_millis(150),
        }
    }
}

/// Counts for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Instruments whose source was actually called.
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Instruments not attempted because the stop flag was raised.
    pub skipped: usize,
    pub samples: usize,
    pub anchors: usize,
    /// Rate-limit signals received, including ones that were retried.
    pub rate_limited: usize,
}

#[derive(Debug, Clone)]
pub struct InstrumentFailure {
    pub instrument: Instrument,
    pub error: SourceError,
}

#[derive(Debug, Default)]
pub struct CycleOutcome {
    /// Anchors produced this cycle; each instrument's records are contiguous
    /// and in timestamp order.
    pub records: Vec<AnchorRecord>,
    pub summary: CycleSummary,
    pub failures: Vec<InstrumentFailure>,
}

impl CycleOutcome {
    pub fn was_interrupted(&self) -> bool {
        self.summary.skipped > 0
    }
}

enum TaskResult {
    Skipped,
    Fetched {
        records: Vec<AnchorRecord>,
        samples: usize,
        rate_limited: usize,
    },
    Failed {
        error: SourceError,
        rate_limited: usize,
    },
}

pub struct Orchestrator {
    source: Arc<dyn SampleSource>,
    compressor: Arc<AnchorCompressor>,
    config: FetchConfig,
    backoff: BackoffPolicy,
    pacer: RequestPacer,
    workers: rayon::ThreadPool,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn SampleSource>,
        compressor: Arc<AnchorCompressor>,
        config: FetchConfig,
        backoff: BackoffPolicy,
    ) -> Result<Self, OrchestratorError> {
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_workers.max(1))
            .thread_name(|i| format!("pricetape-fetch-{i}"))
            .build()?;
        let pacer = RequestPacer::new(config.min_spacing, config.jitter);
        Ok(Self {
            source,
            compressor,
            config,
            backoff,
            pacer,
            workers,
        })
    }

    pub fn compressor(&self) -> &Arc<AnchorCompressor> {
        &self.compressor
    }

    pub fn pacer(&self) -> &RequestPacer {
        &self.pacer
    }

    /// Fetch and compress every instrument once.
    ///
    /// `instruments` is the cycle's snapshot of the pool. When `stop` is
    /// raised, tasks that have not started are counted as skipped and the
    /// records gathered so far are returned.
    pub fn run_cycle(
        &self,
        instruments: &[Instrument],
        window: &FetchWindow,
        stop: Option<&AtomicBool>,
    ) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();
        let batch_size = self.config.batch_size.max(1);

        for (batch_no, batch) in instruments.chunks(batch_size).enumerate() {
            if is_stopped(stop) {
                outcome.summary.skipped += instruments.len() - batch_no * batch_size;
                tracing::info!(skipped = outcome.summary.skipped, "stop requested, ending cycle early");
                break;
            }

            tracing::debug!(batch = batch_no, size = batch.len(), "starting fetch batch");
            let results: Vec<(Instrument, TaskResult)> = self.workers.install(|| {
                batch
                    .par_iter()
                    .map(|instrument| (instrument.clone(), self.run_task(instrument, window, stop)))
                    .collect()
            });

            for (instrument, result) in results {
                let summary = &mut outcome.summary;
                match result {
                    TaskResult::Skipped => summary.skipped += 1,
                    TaskResult::Fetched {
                        records,
                        samples,
                        rate_limited,
                    } => {
                        summary.attempted += 1;
                        summary.succeeded += 1;
                        summary.samples += samples;
                        summary.anchors += records.len();
                        summary.rate_limited += rate_limited;
                        outcome.records.extend(records);
                    }
                    TaskResult::Failed {
                        error,
                        rate_limited,
                    } => {
                        summary.attempted += 1;
                        summary.failed += 1;
                        summary.rate_limited += rate_limited;
                        outcome.failures.push(InstrumentFailure { instrument, error });
                    }
                }
            }
        }

        outcome
    }

    fn run_task(
        &self,
        instrument: &Instrument,
        window: &FetchWindow,
        stop: Option<&AtomicBool>,
    ) -> TaskResult {
        if is_stopped(stop) || !self.pacer.wait(stop) {
            return TaskResult::Skipped;
        }

        let mut rate_limited = 0;
        let mut result = self.fetch(instrument, window);

        let limited = match &result {
            Err(error) if error.is_rate_limit() => Some(error.clone()),
            _ => None,
        };
        if let Some(error) = limited {
            rate_limited += 1;
            let delay = self.backoff_after(&error);
            tracing::warn!(
                instrument = %instrument,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "rate limited, backing off before one retry"
            );
            if !self.pacer.wait(stop) {
                return TaskResult::Failed {
                    error,
                    rate_limited,
                };
            }
            result = self.fetch(instrument, window);
            if let Err(retry_error) = &result {
                if retry_error.is_rate_limit() {
                    rate_limited += 1;
                    self.backoff_after(retry_error);
                }
            }
        }

        match result {
            Ok(samples) => {
                self.pacer.record_success();
                let count = samples.len();
                let records = self.compress(instrument, samples);
                tracing::trace!(instrument = %instrument, samples = count, anchors = records.len(), "fetched");
                TaskResult::Fetched {
                    records,
                    samples: count,
                    rate_limited,
                }
            }
            Err(error) => {
                tracing::warn!(instrument = %instrument, error = %error, "fetch failed");
                TaskResult::Failed {
                    error,
                    rate_limited,
                }
            }
        }
    }

    /// Record a rate-limit signal and push back every worker's next slot.
    fn backoff_after(&self, error: &SourceError) -> Duration {
        let attempt = self.pacer.record_rate_limit();
        let delay = match error.retry_after() {
            Some(hint) => hint.min(self.backoff.max),
            None => self.backoff.delay(attempt),
        };
        self.pacer.penalize(delay);
        delay
    }

    fn fetch(&self, instrument: &Instrument, window: &FetchWindow) -> Result<Vec<RawSample>, SourceError> {
        fetch_with_timeout(
            Arc::clone(&self.source),
            instrument.clone(),
            *window,
            self.config.timeout,
        )
    }

    fn compress(&self, instrument: &Instrument, mut samples: Vec<RawSample>) -> Vec<AnchorRecord> {
        samples.retain(|s| &s.instrument == instrument);
        samples.sort_by_key(|s| s.timestamp);
        let tag = self.source.tag();
        samples
            .iter()
            .filter_map(|sample| self.compressor.consider(sample, tag))
            .collect()
    }
}

fn is_stopped(stop: Option<&AtomicBool>) -> bool {
    stop.is_some_and(|f| f.load(Ordering::Relaxed))
}

/// Run `source.fetch` on a helper thread and give up after `timeout`.
///
/// A timed-out call is abandoned, not cancelled: the helper thread runs to
/// completion in the background and its result is discarded.
pub fn fetch_with_timeout(
    source: Arc<dyn SampleSource>,
    instrument: Instrument,
    window: FetchWindow,
    timeout: Duration,
) -> Result<Vec<RawSample>, SourceError> {
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name(format!("fetch-{instrument}"))
        .spawn(move || {
            let _ = tx.send(source.fetch(&instrument, &window));
        })
        .map_err(|e| SourceError::Network(format!("spawn fetch thread: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(SourceError::Timeout { after: timeout }),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(SourceError::Network("fetch thread exited without a result".into()))
        }
    }
}
