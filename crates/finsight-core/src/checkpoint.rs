//! Durable, versioned snapshots of agent runs.
//!
//! Checkpoints are addressed by [`StreamKey`]: the run identity plus a logical
//! sub-stream (`main`, `outline`, `section-2`, ...). "Latest" is resolved per
//! stream, never globally.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::agent::{HistoryEntry, RunStatus, TerminalResult};
use crate::persist::{path_component, write_atomic};
use crate::sandbox::NamespaceSnapshot;

const CHECKPOINT_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub identity: String,
    pub stream: String,
}

impl StreamKey {
    pub fn new(identity: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            stream: stream.into(),
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.identity, self.stream)
    }
}

/// Immutable snapshot of a run after a fully applied round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u64,
    pub name: String,
    pub round: u32,
    pub status: RunStatus,
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub namespace: Option<NamespaceSnapshot>,
    #[serde(default)]
    pub result: Option<TerminalResult>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to persist checkpoint {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("checkpoint worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("checkpoint version {attempted} for {key} is not newer than {latest}")]
    StaleVersion {
        key: String,
        latest: u64,
        attempted: u64,
    },
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, key: &StreamKey, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn load_latest(&self, key: &StreamKey) -> Result<Option<Checkpoint>, CheckpointError>;

    async fn exists(&self, key: &StreamKey) -> Result<bool, CheckpointError> {
        Ok(self.load_latest(key).await?.is_some())
    }

    /// Streams with at least one checkpoint for `identity`.
    async fn streams(&self, identity: &str) -> Result<Vec<String>, CheckpointError>;
}

/// Filesystem layout: `<root>/<identity>/<stream>/<version>.json`.
///
/// Each file is written to a temp file in the same directory and renamed into
/// place, so readers only ever see complete checkpoints. Files without the
/// `.json` extension (leftover temp files) are ignored. Disk access runs on
/// the blocking pool.
pub struct FsCheckpointStore {
    root: PathBuf,
    locks: DashMap<StreamKey, Arc<Mutex<()>>>,
}

impl FsCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every identity with a checkpoint directory.
    pub fn identities(&self) -> Result<Vec<String>, CheckpointError> {
        list_dirs(&self.root)
    }

    fn stream_dir(&self, key: &StreamKey) -> PathBuf {
        self.root
            .join(path_component(&key.identity))
            .join(path_component(&key.stream))
    }

    fn lock_for(&self, key: &StreamKey) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().value().clone()
    }

    fn latest_version(dir: &Path) -> Result<Option<u64>, CheckpointError> {
        if !dir.exists() {
            return Ok(None);
        }
        let entries = fs::read_dir(dir).map_err(|source| CheckpointError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut latest = None;
        for entry in entries {
            let entry = entry.map_err(|source| CheckpointError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(CHECKPOINT_EXTENSION) {
                continue;
            }
            let Some(version) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            else {
                continue;
            };
            latest = latest.max(Some(version));
        }
        Ok(latest)
    }

    fn checkpoint_path(dir: &Path, version: u64) -> PathBuf {
        dir.join(format!("{version:010}.{CHECKPOINT_EXTENSION}"))
    }

    fn read_checkpoint(path: PathBuf) -> Result<Checkpoint, CheckpointError> {
        let raw = fs::read(&path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|source| CheckpointError::Corrupt { path, source })
    }

    fn read_latest(dir: &Path) -> Result<Option<Checkpoint>, CheckpointError> {
        match Self::latest_version(dir)? {
            Some(version) => Self::read_checkpoint(Self::checkpoint_path(dir, version)).map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    #[instrument(skip(self, checkpoint), fields(key = %key, version = checkpoint.version))]
    async fn save(&self, key: &StreamKey, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let body = serde_json::to_vec_pretty(checkpoint).map_err(CheckpointError::Encode)?;
        let dir = self.stream_dir(key);
        let label = key.to_string();
        let version = checkpoint.version;
        let path = tokio::task::spawn_blocking(move || -> Result<PathBuf, CheckpointError> {
            if let Some(latest) = Self::latest_version(&dir)?
                && version <= latest
            {
                return Err(CheckpointError::StaleVersion {
                    key: label,
                    latest,
                    attempted: version,
                });
            }
            let path = Self::checkpoint_path(&dir, version);
            write_atomic(&path, &body).map_err(|source| CheckpointError::Persist {
                path: path.clone(),
                source,
            })?;
            Ok(path)
        })
        .await??;
        debug!(path = %path.display(), "checkpoint written");
        Ok(())
    }

    async fn load_latest(&self, key: &StreamKey) -> Result<Option<Checkpoint>, CheckpointError> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let dir = self.stream_dir(key);
        tokio::task::spawn_blocking(move || Self::read_latest(&dir)).await?
    }

    /// Stream names come from the checkpoints themselves, since directory
    /// names are escaped.
    async fn streams(&self, identity: &str) -> Result<Vec<String>, CheckpointError> {
        let dir = self.root.join(path_component(identity));
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, CheckpointError> {
            let mut streams = Vec::new();
            for stream in list_dirs(&dir)? {
                if let Some(checkpoint) = Self::read_latest(&dir.join(&stream))? {
                    streams.push(checkpoint.name);
                }
            }
            streams.sort();
            Ok(streams)
        })
        .await?
    }
}

fn list_dirs(dir: &Path) -> Result<Vec<String>, CheckpointError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let io_err = |source| CheckpointError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.file_type().map_err(io_err)?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Process-local store for tests and dry runs.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    entries: DashMap<StreamKey, Vec<Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints retained for `key`.
    pub fn count(&self, key: &StreamKey) -> usize {
        self.entries.get(key).map(|items| items.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, key: &StreamKey, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut slot = self.entries.entry(key.clone()).or_default();
        if let Some(latest) = slot.last().map(|existing| existing.version)
            && checkpoint.version <= latest
        {
            return Err(CheckpointError::StaleVersion {
                key: key.to_string(),
                latest,
                attempted: checkpoint.version,
            });
        }
        slot.push(checkpoint.clone());
        Ok(())
    }

    async fn load_latest(&self, key: &StreamKey) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self
            .entries
            .get(key)
            .and_then(|items| items.last().cloned()))
    }

    async fn streams(&self, identity: &str) -> Result<Vec<String>, CheckpointError> {
        let mut streams: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().identity == identity && !entry.value().is_empty())
            .map(|entry| entry.key().stream.clone())
            .collect();
        streams.sort();
        Ok(streams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Actor, HistoryEntry};

    fn checkpoint(version: u64, round: u32) -> Checkpoint {
        Checkpoint {
            version,
            name: "main".to_string(),
            round,
            status: RunStatus::Running,
            history: vec![HistoryEntry::new(Actor::User, "collect data", 0)],
            namespace: None,
            result: None,
            created_at: Utc::now(),
        }
    }

    fn named(stream: &str, version: u64, round: u32) -> Checkpoint {
        Checkpoint {
            name: stream.to_string(),
            ..checkpoint(version, round)
        }
    }

    #[tokio::test]
    async fn latest_is_resolved_per_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path());
        let outline = StreamKey::new("generator-1", "outline");
        let section = StreamKey::new("generator-1", "section-0");

        store.save(&outline, &named("outline", 1, 1)).await.unwrap();
        store.save(&outline, &named("outline", 2, 2)).await.unwrap();
        store.save(&section, &named("section-0", 1, 5)).await.unwrap();

        assert_eq!(store.load_latest(&outline).await.unwrap().unwrap().round, 2);
        assert_eq!(store.load_latest(&section).await.unwrap().unwrap().round, 5);
        assert_eq!(
            store.streams("generator-1").await.unwrap(),
            vec!["outline".to_string(), "section-0".to_string()]
        );
        assert!(!store.exists(&StreamKey::new("generator-1", "section-1")).await.unwrap());
    }

    #[tokio::test]
    async fn versions_must_increase() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path());
        let key = StreamKey::new("analyzer-1", "main");

        store.save(&key, &checkpoint(3, 1)).await.unwrap();
        let err = store.save(&key, &checkpoint(3, 2)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::StaleVersion { latest: 3, .. }));
    }

    #[tokio::test]
    async fn interrupted_write_leaves_previous_checkpoint_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path());
        let key = StreamKey::new("collector-1", "main");
        store.save(&key, &checkpoint(1, 3)).await.unwrap();

        // What a crash between temp write and rename leaves behind.
        let stream_dir = store.stream_dir(&key);
        fs::write(stream_dir.join(".tmpA1b2C3"), b"{\"version\": 2, \"na").unwrap();

        let latest = store.load_latest(&key).await.unwrap().unwrap();
        assert_eq!(latest.version, 1);
        assert_eq!(latest.round, 3);
    }

    #[tokio::test]
    async fn truncated_checkpoint_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path());
        let key = StreamKey::new("collector-1", "main");
        store.save(&key, &checkpoint(1, 1)).await.unwrap();
        fs::write(
            FsCheckpointStore::checkpoint_path(&store.stream_dir(&key), 2),
            b"{\"version\"",
        )
        .unwrap();

        assert!(matches!(
            store.load_latest(&key).await,
            Err(CheckpointError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn in_memory_store_keeps_history() {
        let store = InMemoryCheckpointStore::new();
        let key = StreamKey::new("x", "main");
        assert!(store.load_latest(&key).await.unwrap().is_none());
        store.save(&key, &checkpoint(1, 1)).await.unwrap();
        store.save(&key, &checkpoint(2, 2)).await.unwrap();
        assert_eq!(store.count(&key), 2);
        assert_eq!(store.load_latest(&key).await.unwrap().unwrap().version, 2);
        assert!(store.save(&key, &checkpoint(2, 3)).await.is_err());
    }

    #[tokio::test]
    async fn escaped_stream_names_are_listed_as_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path());
        let dotted = StreamKey::new("analyzer-1", "section.1");
        let underscored = StreamKey::new("analyzer-1", "section_1");

        store.save(&dotted, &named("section.1", 1, 1)).await.unwrap();
        store.save(&underscored, &named("section_1", 1, 4)).await.unwrap();

        assert_eq!(store.load_latest(&dotted).await.unwrap().unwrap().round, 1);
        assert_eq!(store.load_latest(&underscored).await.unwrap().unwrap().round, 4);
        assert_eq!(
            store.streams("analyzer-1").await.unwrap(),
            vec!["section.1".to_string(), "section_1".to_string()]
        );
    }
}
