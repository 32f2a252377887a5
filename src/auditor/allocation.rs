//! Persisted per-prover capacity estimates.
//!
//! The auditor's view of each prover survives restarts through a JSON
//! snapshot, rewritten atomically (temp file + rename) after every
//! successful weight emission and restored at startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::PeerId;

/// One uid slot of the auditor's state: the prover's identity, the current
/// chunk-count estimate and the hash shard backing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub hotkey: PeerId,
    pub n_chunks: u64,
    pub db_path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed allocation snapshot: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Write the snapshot atomically next to its final location.
pub fn save_snapshot(path: &Path, records: &[AllocationRecord]) -> Result<(), SnapshotError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(records)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a previously saved snapshot; `None` when no snapshot exists.
pub fn load_snapshot(path: &Path) -> Result<Option<Vec<AllocationRecord>>, SnapshotError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&raw)?))
}
