//! pricetape core: data model, deadband compressor, sample sources,
//! instrument pool, compressor snapshots and the partitioned anchor store.
//!
//! Everything here is synchronous and free of scheduling policy. The runner
//! crate decides when and how concurrently these pieces are driven.

mod atomic;
pub mod compressor;
pub mod model;
pub mod pool;
pub mod source;
pub mod state;
pub mod store;

pub use compressor::{AnchorCompressor, AnchorState, CompressorError, Rejection};
pub use model::{AnchorRecord, FetchWindow, Instrument, InstrumentError, RawSample, SourceTag};
pub use pool::{InstrumentPool, PoolError, StaticPool, TomlPool, DISCOVERED_GROUP};
pub use source::{CsvReplaySource, SampleSource, SourceError, YahooSource};
pub use state::{StateError, StateSnapshot};
pub use store::{MergeReport, PartitionKey, PartitionStore, StoreError};
