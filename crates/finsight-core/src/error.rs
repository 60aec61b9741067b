use std::path::PathBuf;

use thiserror::Error;

use crate::checkpoint::CheckpointError;

/// Core error type for FinSight configuration and startup.
#[derive(Debug, Error)]
pub enum FinsightError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FinsightError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }
}

/// Failures that abort an agent run.
///
/// Everything else that goes wrong inside a round becomes an observation the
/// next inference request can react to.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("inference capability failed permanently: {0}")]
    Inference(String),
    #[error("failed to read checkpoint for {identity}/{stream}: {source}")]
    CheckpointRead {
        identity: String,
        stream: String,
        #[source]
        source: CheckpointError,
    },
    #[error("failed to write checkpoint for {identity}/{stream}: {source}")]
    CheckpointWrite {
        identity: String,
        stream: String,
        #[source]
        source: CheckpointError,
    },
    #[error("failed to restore code namespace for {identity}: {source}")]
    Namespace {
        identity: String,
        #[source]
        source: anyhow::Error,
    },
}

impl RunError {
    /// Stable label used in logs, metrics and stage reports.
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Inference(_) => "inference",
            RunError::CheckpointRead { .. } => "checkpoint_read",
            RunError::CheckpointWrite { .. } => "checkpoint_write",
            RunError::Namespace { .. } => "namespace",
        }
    }
}
