//! Instrument pool: the set of instruments under observation.
//!
//! The file-backed pool is a TOML document of named groups (watchlists),
//! each a list of identifiers. Loading flattens every group into one
//! deduplicated, case-normalized set; identifiers can appear in several
//! groups without being polled twice.
//!
//! `TomlPool::load` re-reads the file on every call, so a long-running
//! collector picks up instruments added by other processes. Saving merges
//! local additions into whatever is on disk at that moment.

use crate::atomic::write_atomic;
use crate::model::{Instrument, InstrumentError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Group that receives instruments added out-of-band.
pub const DISCOVERED_GROUP: &str = "discovered";

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse pool TOML: {0}")]
    Parse(String),

    #[error("invalid instrument in group '{group}': {source}")]
    InvalidInstrument {
        group: String,
        #[source]
        source: InstrumentError,
    },
}

/// Source of the instrument set for a cycle.
pub trait InstrumentPool: Send {
    /// Current deduplicated set.
    fn load(&self) -> Result<BTreeSet<Instrument>, PoolError>;

    /// Add an instrument. Returns false if it was already present.
    fn add(&mut self, instrument: Instrument) -> bool;

    /// Persist additions. In-memory pools treat this as a no-op.
    fn save(&self) -> Result<(), PoolError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PoolDocument {
    #[serde(default)]
    groups: BTreeMap<String, Vec<String>>,
}

impl PoolDocument {
    fn instruments(&self) -> Result<BTreeSet<Instrument>, PoolError> {
        let mut set = BTreeSet::new();
        for (group, members) in &self.groups {
            for raw in members {
                let instrument =
                    Instrument::new(raw).map_err(|source| PoolError::InvalidInstrument {
                        group: group.clone(),
                        source,
                    })?;
                set.insert(instrument);
            }
        }
        Ok(set)
    }

    /// Append members of `other` that this document does not hold yet.
    fn absorb(&mut self, other: &PoolDocument) {
        let mut known: BTreeSet<Instrument> = self
            .groups
            .values()
            .flatten()
            .filter_map(|raw| Instrument::new(raw).ok())
            .collect();
        for (group, members) in &other.groups {
            let target = self.groups.entry(group.clone()).or_default();
            for raw in members {
                match Instrument::new(raw) {
                    Ok(instrument) if !known.insert(instrument.clone()) => {}
                    _ => target.push(raw.clone()),
                }
            }
        }
    }
}

/// Pool stored as a TOML file of named groups.
///
/// The in-memory document holds what was read at `open` plus local
/// additions; `load` always reflects the file when it exists.
#[derive(Debug, Clone)]
pub struct TomlPool {
    path: PathBuf,
    doc: PoolDocument,
}

impl TomlPool {
    /// Open the pool at `path`. A missing file is an empty pool.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PoolError> {
        let path = path.into();
        let doc = read_document(&path)?.unwrap_or_default();
        Ok(Self { path, doc })
    }

    /// Build an unsaved pool from TOML text.
    pub fn from_toml(path: impl Into<PathBuf>, content: &str) -> Result<Self, PoolError> {
        Ok(Self {
            path: path.into(),
            doc: parse_document(content)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn group_names(&self) -> Vec<&str> {
        self.doc.groups.keys().map(|s| s.as_str()).collect()
    }

    pub fn group(&self, name: &str) -> Option<&[String]> {
        self.doc.groups.get(name).map(|v| v.as_slice())
    }

    /// Add to a named group, creating it if needed.
    pub fn add_to_group(&mut self, group: &str, instrument: Instrument) -> bool {
        if self.contains(&instrument) {
            return false;
        }
        self.doc
            .groups
            .entry(group.to_string())
            .or_default()
            .push(instrument.to_string());
        true
    }

    fn contains(&self, instrument: &Instrument) -> bool {
        self.doc
            .groups
            .values()
            .flatten()
            .any(|raw| Instrument::new(raw).is_ok_and(|i| &i == instrument))
    }
}

fn parse_document(content: &str) -> Result<PoolDocument, PoolError> {
    toml::from_str(content).map_err(|e| PoolError::Parse(e.to_string()))
}

/// Current on-disk document, or `None` if the file does not exist.
fn read_document(path: &Path) -> Result<Option<PoolDocument>, PoolError> {
    match fs::read_to_string(path) {
        Ok(content) => parse_document(&content).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(PoolError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

impl InstrumentPool for TomlPool {
    /// Re-read the file. Before the first save of a new pool, the in-memory
    /// document stands in for the missing file.
    fn load(&self) -> Result<BTreeSet<Instrument>, PoolError> {
        match read_document(&self.path)? {
            Some(doc) => doc.instruments(),
            None => self.doc.instruments(),
        }
    }

    fn add(&mut self, instrument: Instrument) -> bool {
        self.add_to_group(DISCOVERED_GROUP, instrument)
    }

    fn save(&self) -> Result<(), PoolError> {
        let mut doc = read_document(&self.path)?.unwrap_or_default();
        doc.absorb(&self.doc);
        let content = toml::to_string_pretty(&doc)
            .map_err(|e| PoolError::Parse(format!("serialize: {e}")))?;

        let io_err = |source| PoolError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        write_atomic(&self.path, content.as_bytes()).map_err(io_err)
    }
}

/// Fixed in-memory pool.
#[derive(Debug, Clone, Default)]
pub struct StaticPool {
    instruments: BTreeSet<Instrument>,
}

impl StaticPool {
    pub fn new(instruments: impl IntoIterator<Item = Instrument>) -> Self {
        Self {
            instruments: instruments.into_iter().collect(),
        }
    }

    /// Parse raw identifiers, failing on the first invalid one.
    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Result<Self, InstrumentError> {
        let instruments = raw
            .iter()
            .map(|s| Instrument::new(s.as_ref()))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self { instruments })
    }
}

impl InstrumentPool for StaticPool {
    fn load(&self) -> Result<BTreeSet<Instrument>, PoolError> {
        Ok(self.instruments.clone())
    }

    fn add(&mut self, instrument: Instrument) -> bool {
        self.instruments.insert(instrument)
    }

    fn save(&self) -> Result<(), PoolError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[groups]
watchlist = ["spy", "QQQ", "aapl"]
tech = ["AAPL", "msft"]
"#;

    fn names(set: &BTreeSet<Instrument>) -> Vec<&str> {
        set.iter().map(|i| i.as_str()).collect()
    }

    #[test]
    fn load_flattens_and_dedups() {
        let pool = TomlPool::from_toml("pool.toml", SAMPLE).unwrap();
        let set = pool.load().unwrap();
        assert_eq!(names(&set), vec!["AAPL", "MSFT", "QQQ", "SPY"]);
        assert_eq!(pool.group_names(), vec!["tech", "watchlist"]);
    }

    #[test]
    fn invalid_member_names_group() {
        let pool = TomlPool::from_toml("pool.toml", "[groups]\nbad = [\"A B\"]\n").unwrap();
        match pool.load() {
            Err(PoolError::InvalidInstrument { group, .. }) => assert_eq!(group, "bad"),
            other => panic!("expected InvalidInstrument, got {other:?}"),
        }
    }

    #[test]
    fn add_goes_to_discovered_and_skips_duplicates() {
        let mut pool = TomlPool::from_toml("pool.toml", SAMPLE).unwrap();
        assert!(!pool.add(Instrument::new("Msft").unwrap()));
        assert!(pool.add(Instrument::new("nvda").unwrap()));
        assert_eq!(pool.group(DISCOVERED_GROUP).unwrap(), &["NVDA".to_string()]);
    }

    #[test]
    fn save_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.toml");

        let mut pool = TomlPool::open(&path).unwrap();
        assert!(pool.load().unwrap().is_empty());
        pool.add(Instrument::new("AAA").unwrap());
        pool.add_to_group("watchlist", Instrument::new("BBB").unwrap());
        pool.save().unwrap();

        let reopened = TomlPool::open(&path).unwrap();
        assert_eq!(names(&reopened.load().unwrap()), vec!["AAA", "BBB"]);
    }

    #[test]
    fn load_sees_out_of_band_additions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.toml");
        fs::write(&path, "[groups]\nwatch = [\"AAA\"]\n").unwrap();

        let running = TomlPool::open(&path).unwrap();
        assert_eq!(names(&running.load().unwrap()), vec!["AAA"]);

        let mut other = TomlPool::open(&path).unwrap();
        other.add(Instrument::new("bbb").unwrap());
        other.save().unwrap();

        assert_eq!(names(&running.load().unwrap()), vec!["AAA", "BBB"]);
    }

    #[test]
    fn load_fails_once_file_turns_unparsable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.toml");
        fs::write(&path, "[groups]\nwatch = [\"AAA\"]\n").unwrap();
        let pool = TomlPool::open(&path).unwrap();

        fs::write(&path, "[groups\nwatch = ").unwrap();
        assert!(matches!(pool.load(), Err(PoolError::Parse(_))));
    }

    #[test]
    fn save_keeps_additions_from_other_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.toml");
        fs::write(&path, "[groups]\nwatch = [\"AAA\"]\n").unwrap();

        let mut first = TomlPool::open(&path).unwrap();
        let mut second = TomlPool::open(&path).unwrap();
        first.add(Instrument::new("BBB").unwrap());
        first.save().unwrap();
        second.add(Instrument::new("CCC").unwrap());
        second.add_to_group("watch", Instrument::new("DDD").unwrap());
        second.save().unwrap();

        let reopened = TomlPool::open(&path).unwrap();
        assert_eq!(names(&reopened.load().unwrap()), vec!["AAA", "BBB", "CCC", "DDD"]);
        assert_eq!(
            reopened.group(DISCOVERED_GROUP).unwrap(),
            &["BBB".to_string(), "CCC".to_string()]
        );
        assert_eq!(reopened.group("watch").unwrap(), &["AAA".to_string(), "DDD".to_string()]);
    }

    #[test]
    fn static_pool_parses_and_normalizes() {
        let mut pool = StaticPool::parse(&["bbb", "AAA", "aaa"]).unwrap();
        assert_eq!(names(&pool.load().unwrap()), vec!["AAA", "BBB"]);
        assert!(!pool.add(Instrument::new("Bbb").unwrap()));
        assert!(StaticPool::parse(&[""]).is_err());
    }
}
