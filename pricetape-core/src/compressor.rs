//! Deadband anchor compressor.
//!
//! Remembers the last accepted anchor per instrument and only lets a sample
//! through when it moves at least `threshold` (relative) away from it.
//!
//! The decision and the state update happen while holding the map entry for
//! that instrument, so two workers racing on the same instrument can never
//! both accept against the same stale anchor.

use crate::model::{AnchorRecord, Instrument, RawSample, SourceTag};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Remembered anchor for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnchorState {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompressorError {
    #[error("deadband threshold must be finite and in (0, 1), got {0}")]
    InvalidThreshold(f64),
}

/// Why a sample did not become an anchor. Only used for tracing and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    InvalidPrice,
    Stale,
    WithinDeadband,
}

pub struct AnchorCompressor {
    threshold: f64,
    skip_stale: bool,
    anchors: DashMap<Instrument, AnchorState>,
}

impl AnchorCompressor {
    pub fn new(threshold: f64) -> Result<Self, CompressorError> {
        if !threshold.is_finite() || threshold <= 0.0 || threshold >= 1.0 {
            return Err(CompressorError::InvalidThreshold(threshold));
        }
        Ok(Self {
            threshold,
            skip_stale: true,
            anchors: DashMap::new(),
        })
    }

    /// Rebuild a compressor from a persisted anchor map.
    pub fn from_anchors(
        threshold: f64,
        anchors: BTreeMap<Instrument, AnchorState>,
    ) -> Result<Self, CompressorError> {
        let compressor = Self::new(threshold)?;
        for (instrument, state) in anchors {
            compressor.anchors.insert(instrument, state);
        }
        Ok(compressor)
    }

    /// Toggle the stale-sample guard (on by default).
    ///
    /// With the guard on, a sample not strictly newer than the remembered
    /// anchor is dropped. Sources that resend a whole intraday history every
    /// cycle would otherwise rewind the anchor to old prices.
    pub fn with_stale_guard(mut self, enabled: bool) -> Self {
        self.skip_stale = enabled;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Decide whether `sample` is a new anchor, updating state if it is.
    pub fn consider(&self, sample: &RawSample, source: SourceTag) -> Option<AnchorRecord> {
        match self.evaluate(sample, source) {
            Ok(record) => Some(record),
            Err(reason) => {
                tracing::trace!(
                    instrument = %sample.instrument,
                    price = sample.price,
                    ?reason,
                    "sample rejected"
                );
                None
            }
        }
    }

    /// Same as [`consider`](Self::consider) but reports the rejection reason.
    pub fn evaluate(&self, sample: &RawSample, source: SourceTag) -> Result<AnchorRecord, Rejection> {
        if !sample.price.is_finite() || sample.price <= 0.0 {
            return Err(Rejection::InvalidPrice);
        }

        let accepted = AnchorState {
            price: sample.price,
            timestamp: sample.timestamp,
        };

        match self.anchors.entry(sample.instrument.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(accepted);
            }
            Entry::Occupied(mut slot) => {
                let last = *slot.get();
                // A damaged anchor can only come from a bad snapshot. It is
                // replaced regardless of its timestamp.
                if is_usable_anchor(last.price) {
                    if self.skip_stale && sample.timestamp <= last.timestamp {
                        return Err(Rejection::Stale);
                    }
                    if !exceeds_deadband(last.price, sample.price, self.threshold) {
                        return Err(Rejection::WithinDeadband);
                    }
                }
                slot.insert(accepted);
            }
        }

        Ok(AnchorRecord {
            instrument: sample.instrument.clone(),
            timestamp: sample.timestamp,
            price: sample.price,
            source,
        })
    }

    pub fn last_anchor(&self, instrument: &Instrument) -> Option<AnchorState> {
        self.anchors.get(instrument).map(|entry| *entry.value())
    }

    /// Put an instrument's remembered anchor back to `state` (or forget it).
    ///
    /// Used to undo anchors whose records never reached durable storage, so
    /// the same samples are accepted again on the next cycle.
    pub fn restore(&self, instrument: &Instrument, state: Option<AnchorState>) {
        match state {
            Some(state) => {
                self.anchors.insert(instrument.clone(), state);
            }
            None => {
                self.anchors.remove(instrument);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Point-in-time copy of the anchor map, ordered for stable serialization.
    pub fn anchors(&self) -> BTreeMap<Instrument, AnchorState> {
        self.anchors
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

fn is_usable_anchor(price: f64) -> bool {
    price > 0.0 && price.is_finite()
}

/// Relative deviation test against a usable `last`.
fn exceeds_deadband(last: f64, price: f64, threshold: f64) -> bool {
    (price - last).abs() / last >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn inst(s: &str) -> Instrument {
        Instrument::new(s).unwrap()
    }

    fn sample(s: &str, secs: i64, price: f64) -> RawSample {
        RawSample {
            instrument: inst(s),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            price,
        }
    }

    fn accepted_prices(c: &AnchorCompressor, prices: &[f64]) -> Vec<f64> {
        prices
            .iter()
            .enumerate()
            .filter_map(|(i, &p)| c.consider(&sample("AAA", i as i64, p), SourceTag::Live))
            .map(|r| r.price)
            .collect()
    }

    #[test]
    fn rejects_bad_thresholds() {
        assert!(AnchorCompressor::new(0.0).is_err());
        assert!(AnchorCompressor::new(-0.01).is_err());
        assert!(AnchorCompressor::new(1.0).is_err());
        assert!(AnchorCompressor::new(f64::NAN).is_err());
        assert!(AnchorCompressor::new(0.0005).is_ok());
    }

    #[test]
    fn deadband_reference_sequence() {
        let c = AnchorCompressor::new(0.0005).unwrap();
        let got = accepted_prices(&c, &[100.00, 100.03, 100.10, 99.90]);
        assert_eq!(got, vec![100.00, 100.10, 99.90]);
        assert_eq!(c.last_anchor(&inst("AAA")).unwrap().price, 99.90);
    }

    #[test]
    fn first_sample_always_accepted() {
        let c = AnchorCompressor::new(0.5).unwrap();
        assert!(c.consider(&sample("ZZZ", 0, 42.0), SourceTag::Live).is_some());
    }

    #[test]
    fn invalid_prices_are_ignored_without_state_change() {
        let c = AnchorCompressor::new(0.001).unwrap();
        for p in [0.0, -1.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert_eq!(
                c.evaluate(&sample("AAA", 0, p), SourceTag::Live),
                Err(Rejection::InvalidPrice)
            );
        }
        assert!(c.is_empty());
    }

    #[test]
    fn rejection_leaves_anchor_unchanged() {
        let c = AnchorCompressor::new(0.0001).unwrap();
        c.consider(&sample("AAA", 0, 10.0), SourceTag::Live).unwrap();
        let before = c.last_anchor(&inst("AAA")).unwrap();
        assert_eq!(
            c.evaluate(&sample("AAA", 60, 10.0005), SourceTag::Live),
            Err(Rejection::WithinDeadband)
        );
        assert_eq!(c.last_anchor(&inst("AAA")).unwrap(), before);
    }

    #[test]
    fn zero_anchor_fails_closed() {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        // Damaged anchors stamped before, at, and after the incoming sample.
        for (offset, damaged) in [(-60, 0.0), (0, 0.0), (60, 0.0), (0, f64::NAN), (60, -3.0)] {
            let mut seeded = BTreeMap::new();
            seeded.insert(
                inst("AAA"),
                AnchorState {
                    price: damaged,
                    timestamp: base + chrono::Duration::seconds(offset),
                },
            );
            let c = AnchorCompressor::from_anchors(0.01, seeded).unwrap();
            let rec = c.evaluate(&sample("AAA", 0, 5.0), SourceTag::Live);
            assert_eq!(rec.map(|r| r.price), Ok(5.0), "anchor {damaged} at {offset:+}s");
            let now = c.last_anchor(&inst("AAA")).unwrap();
            assert_eq!(now.price, 5.0);
            assert_eq!(now.timestamp, base);
        }
    }

    #[test]
    fn stale_samples_do_not_rewind_anchor() {
        let c = AnchorCompressor::new(0.001).unwrap();
        c.consider(&sample("AAA", 100, 50.0), SourceTag::Live).unwrap();
        assert_eq!(
            c.evaluate(&sample("AAA", 50, 60.0), SourceTag::Intraday),
            Err(Rejection::Stale)
        );
        assert_eq!(
            c.evaluate(&sample("AAA", 100, 60.0), SourceTag::Intraday),
            Err(Rejection::Stale)
        );

        let unguarded = AnchorCompressor::new(0.001).unwrap().with_stale_guard(false);
        unguarded.consider(&sample("AAA", 100, 50.0), SourceTag::Live).unwrap();
        assert!(unguarded.consider(&sample("AAA", 50, 60.0), SourceTag::Live).is_some());
    }

    #[test]
    fn restore_rewinds_or_forgets() {
        let c = AnchorCompressor::new(0.01).unwrap();
        c.consider(&sample("AAA", 0, 10.0), SourceTag::Live).unwrap();
        let before = c.last_anchor(&inst("AAA"));
        c.consider(&sample("AAA", 1, 11.0), SourceTag::Live).unwrap();

        c.restore(&inst("AAA"), before);
        assert_eq!(c.last_anchor(&inst("AAA")).unwrap().price, 10.0);
        assert!(c.consider(&sample("AAA", 1, 11.0), SourceTag::Live).is_some());

        c.restore(&inst("AAA"), None);
        assert!(c.is_empty());
    }

    #[test]
    fn instruments_are_independent() {
        let c = AnchorCompressor::new(0.01).unwrap();
        assert!(c.consider(&sample("AAA", 0, 10.0), SourceTag::Live).is_some());
        assert!(c.consider(&sample("BBB", 0, 10.0), SourceTag::Live).is_some());
        assert!(c.consider(&sample("AAA", 1, 10.05), SourceTag::Live).is_none());
        assert!(c.consider(&sample("BBB", 1, 10.2), SourceTag::Live).is_some());
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn concurrent_racers_accept_once() {
        // Many threads offer the same significant move; only one may win.
        let c = Arc::new(AnchorCompressor::new(0.01).unwrap());
        c.consider(&sample("AAA", 0, 100.0), SourceTag::Live).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    c.consider(&sample("AAA", 10, 105.0), SourceTag::Live).is_some()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(wins, 1);
    }

    proptest! {
        #[test]
        fn accepted_set_matches_reference_model(
            prices in proptest::collection::vec(1.0f64..1000.0, 1..200),
            threshold in 0.0001f64..0.05,
        ) {
            let c = AnchorCompressor::new(threshold).unwrap();
            let got = accepted_prices(&c, &prices);

            let mut expected = Vec::new();
            let mut last: Option<f64> = None;
            for &p in &prices {
                let take = match last {
                    None => true,
                    Some(l) => (p - l).abs() / l >= threshold,
                };
                if take {
                    expected.push(p);
                    last = Some(p);
                }
            }
            prop_assert_eq!(got, expected);
        }
    }
}
