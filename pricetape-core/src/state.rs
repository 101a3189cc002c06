//! Compressor state snapshot: JSON file with a BLAKE3 checksum.
//!
//! Layout on disk is a single pretty-printed JSON document. Saves go through
//! a temp file in the same directory followed by a rename, so a crash leaves
//! either the previous snapshot or the new one, never a torn file.

use crate::atomic::write_atomic;
use crate::compressor::AnchorState;
use crate::model::Instrument;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("snapshot I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("snapshot at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("snapshot at {path} has checksum {found}, expected {expected}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("snapshot version {found} is not supported (max {SNAPSHOT_VERSION})")]
    UnsupportedVersion { found: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub anchors: BTreeMap<Instrument, AnchorState>,
    pub checksum: String,
}

impl StateSnapshot {
    pub fn new(anchors: BTreeMap<Instrument, AnchorState>) -> Result<Self, StateError> {
        let checksum = checksum_of(&anchors)?;
        Ok(Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            anchors,
            checksum,
        })
    }

    /// Atomically replace the snapshot at `path`.
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_vec_pretty(self).map_err(|e| StateError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("serialize: {e}"),
        })?;

        write_atomic(path, &json).map_err(io_err)?;

        tracing::debug!(path = %path.display(), anchors = self.anchors.len(), "saved compressor snapshot");
        Ok(())
    }

    /// Load a snapshot. A missing file is not an error: it means "start empty".
    pub fn load(path: &Path) -> Result<Option<Self>, StateError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let snapshot: StateSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if snapshot.version > SNAPSHOT_VERSION {
            return Err(StateError::UnsupportedVersion {
                found: snapshot.version,
            });
        }

        let expected = checksum_of(&snapshot.anchors)?;
        if expected != snapshot.checksum {
            return Err(StateError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected,
                found: snapshot.checksum,
            });
        }

        Ok(Some(snapshot))
    }

    /// Move an unreadable snapshot aside as `{name}.quarantined`.
    pub fn quarantine(path: &Path) -> Result<PathBuf, StateError> {
        let mut name = path.as_os_str().to_os_string();
        name.push(".quarantined");
        let target = PathBuf::from(name);
        fs::rename(path, &target).map_err(|source| StateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(target)
    }
}

fn checksum_of(anchors: &BTreeMap<Instrument, AnchorState>) -> Result<String, StateError> {
    let canonical = serde_json::to_vec(anchors).map_err(|e| StateError::Corrupt {
        path: PathBuf::new(),
        reason: format!("serialize anchors: {e}"),
    })?;
    Ok(blake3::hash(&canonical).to_hex().to_string())
}
