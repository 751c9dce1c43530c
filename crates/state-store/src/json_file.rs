//! JSON files on local disk.
//!
//! Writes go to a sibling `*.tmp` file which is flushed to disk and then
//! renamed over the target, so a crash mid-write leaves either the old file or
//! the new one, never a torn one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use routing::{PersistedScores, PersistenceError, ScoreRepository, WeightRepository, WeightSnapshot};

pub const SCORES_FILE: &str = "scores.json";
pub const WEIGHTS_FILE: &str = "weights.json";

fn io_error(path: &Path, err: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

/// Reads and decodes `path`. `Ok(None)` if the file does not exist.
///
/// # Errors
///
/// [`PersistenceError::Io`] for read failures, [`PersistenceError::Corrupt`]
/// for undecodable contents.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistenceError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_error(path, err)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| PersistenceError::Corrupt {
            path: path.display().to_string(),
            message: err.to_string(),
        })
}

/// Encodes `value` and atomically replaces `path` with it.
///
/// # Errors
///
/// [`PersistenceError::Io`] if any step of the write fails.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistenceError> {
    let encoded = serde_json::to_vec_pretty(value).map_err(|err| PersistenceError::Corrupt {
        path: path.display().to_string(),
        message: err.to_string(),
    })?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| io_error(parent, err))?;
    }

    let tmp_path = path.with_extension("tmp");
    let mut tmp = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|err| io_error(&tmp_path, err))?;
    tmp.write_all(&encoded)
        .await
        .map_err(|err| io_error(&tmp_path, err))?;
    tmp.sync_all()
        .await
        .map_err(|err| io_error(&tmp_path, err))?;
    drop(tmp);
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|err| io_error(path, err))?;

    debug!(path = %path.display(), bytes = encoded.len(), "State written");
    Ok(())
}

/// Score, usage, and weight state kept as JSON files in one directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn scores_path(&self) -> PathBuf {
        self.dir.join(SCORES_FILE)
    }

    fn weights_path(&self) -> PathBuf {
        self.dir.join(WEIGHTS_FILE)
    }
}

#[async_trait]
impl ScoreRepository for JsonFileStore {
    async fn load_scores(&self) -> Result<Option<PersistedScores>, PersistenceError> {
        read_json(&self.scores_path()).await
    }

    async fn save_scores(&self, state: &PersistedScores) -> Result<(), PersistenceError> {
        write_json(&self.scores_path(), state).await
    }
}

#[async_trait]
impl WeightRepository for JsonFileStore {
    async fn load_weights(&self) -> Result<Option<WeightSnapshot>, PersistenceError> {
        read_json(&self.weights_path()).await
    }

    async fn save_weights(&self, snapshot: &WeightSnapshot) -> Result<(), PersistenceError> {
        write_json(&self.weights_path(), snapshot).await
    }
}
