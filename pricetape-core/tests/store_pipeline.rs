//! Integration tests: samples through the compressor into the partition store.

use chrono::{DateTime, Duration, TimeZone, Utc};
use pricetape_core::model::{AnchorRecord, Instrument, RawSample, SourceTag};
use pricetape_core::store::{PartitionKey, PartitionStore};
use pricetape_core::AnchorCompressor;
use std::sync::Arc;
use std::thread;

fn inst(s: &str) -> Instrument {
    Instrument::new(s).unwrap()
}

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, 13, 30, 0).unwrap()
}

fn sample(instrument: &str, minute: i64, price: f64) -> RawSample {
    RawSample {
        instrument: inst(instrument),
        timestamp: base() + Duration::minutes(minute),
        price,
    }
}

fn compress(compressor: &AnchorCompressor, samples: &[RawSample]) -> Vec<AnchorRecord> {
    samples
        .iter()
        .filter_map(|s| compressor.consider(s, SourceTag::Live))
        .collect()
}

#[test]
fn two_instruments_two_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let store = PartitionStore::open(dir.path()).unwrap();
    let compressor = AnchorCompressor::new(0.0005).unwrap();

    let cycle1 = compress(
        &compressor,
        &[
            sample("AAA", 0, 100.0),
            sample("AAA", 1, 100.03),
            sample("AAA", 2, 100.10),
            sample("BBB", 0, 50.0),
        ],
    );
    assert_eq!(cycle1.len(), 3);
    store.merge(cycle1).unwrap();

    // Second cycle resends the history plus one new point.
    let cycle2 = compress(
        &compressor,
        &[
            sample("AAA", 0, 100.0),
            sample("AAA", 2, 100.10),
            sample("AAA", 3, 99.90),
            sample("BBB", 1, 50.01),
        ],
    );
    assert_eq!(cycle2.len(), 1);
    let report = store.merge(cycle2).unwrap();
    assert_eq!(report.records_added, 1);

    let aaa = store.read_instrument(&inst("AAA"), 2024..=2024).unwrap();
    let prices: Vec<f64> = aaa.iter().map(|r| r.price).collect();
    assert_eq!(prices, vec![100.0, 100.10, 99.90]);

    let bbb = store.read_instrument(&inst("BBB"), 2024..=2024).unwrap();
    assert_eq!(bbb.len(), 1);
    assert_eq!(bbb[0].price, 50.0);
}

#[test]
fn concurrent_merges_into_one_partition_lose_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(PartitionStore::open(dir.path()).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let records: Vec<AnchorRecord> = (0..25)
                    .map(|i| AnchorRecord {
                        instrument: inst(&format!("A{worker}")),
                        timestamp: base() + Duration::seconds(i),
                        price: 10.0 + i as f64,
                        source: SourceTag::Live,
                    })
                    .collect();
                store.merge(records).unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap().all_succeeded());
    }

    let key = PartitionKey::new(&inst("A0"), 2024);
    let records = store.read_partition(&key).unwrap();
    assert_eq!(records.len(), 8 * 25);
    assert!(records
        .windows(2)
        .all(|w| (w[0].timestamp, &w[0].instrument) < (w[1].timestamp, &w[1].instrument)));
}

#[test]
fn reopen_sees_committed_partitions() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = PartitionStore::open(dir.path()).unwrap();
        store
            .merge(vec![
                AnchorRecord {
                    instrument: inst("XYZ"),
                    timestamp: base(),
                    price: 1.5,
                    source: SourceTag::Replay,
                },
                AnchorRecord {
                    instrument: inst("XYZ"),
                    timestamp: Utc.with_ymd_and_hms(2031, 1, 2, 0, 0, 0).unwrap(),
                    price: 2.5,
                    source: SourceTag::Replay,
                },
            ])
            .unwrap();
    }

    let store = PartitionStore::open(dir.path()).unwrap();
    let keys = store.list_partitions().unwrap();
    assert_eq!(
        keys,
        vec![PartitionKey::new(&inst("X"), 2024), PartitionKey::new(&inst("X"), 2031)]
    );
    assert!(dir
        .path()
        .join("decade=2030/bucket=X/2031.parquet")
        .exists());
}

#[test]
fn manual_correction_overrides_live_anchor() {
    let dir = tempfile::tempdir().unwrap();
    let store = PartitionStore::open(dir.path()).unwrap();
    let live = AnchorRecord {
        instrument: inst("FIX"),
        timestamp: base(),
        price: 10.0,
        source: SourceTag::Live,
    };
    store.merge(vec![live.clone()]).unwrap();

    let manual = AnchorRecord {
        price: 10.5,
        source: SourceTag::Manual,
        ..live.clone()
    };
    let report = store.merge(vec![manual]).unwrap();
    assert_eq!(report.records_replaced, 1);

    // A later replay of the same point cannot undo the correction.
    let replay = AnchorRecord {
        price: 9.0,
        source: SourceTag::Replay,
        ..live
    };
    let report = store.merge(vec![replay]).unwrap();
    assert_eq!(report.partitions_unchanged, 1);

    let stored = store.read_instrument(&inst("FIX"), 2024..=2024).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].price, 10.5);
    assert_eq!(stored[0].source, SourceTag::Manual);
}
