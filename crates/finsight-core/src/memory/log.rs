use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::MemoryEntry;

const ENTRIES_FILE: &str = "entries.jsonl";
const EMBEDDINGS_FILE: &str = "embeddings.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum LogRecord {
    Insert {
        entry: MemoryEntry,
    },
    Merge {
        fingerprint: String,
        #[serde(default)]
        source: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        task_id: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EmbeddingRecord {
    pub fingerprint: String,
    pub vector: Vec<f32>,
}

/// Append-only persistence for shared memory.
///
/// `entries.jsonl` holds insert and merge records keyed by fingerprint;
/// `embeddings.jsonl` is the side index of cached vectors.
pub struct MemoryLog {
    dir: PathBuf,
    writer: Mutex<()>,
}

impl MemoryLog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create memory dir {}", dir.display()))?;
        for file in [ENTRIES_FILE, EMBEDDINGS_FILE] {
            terminate_last_line(&dir.join(file))?;
        }
        Ok(Self {
            dir,
            writer: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn append(&self, record: &LogRecord) -> Result<()> {
        self.append_line(ENTRIES_FILE, record)
    }

    pub(crate) fn append_embedding(&self, record: &EmbeddingRecord) -> Result<()> {
        self.append_line(EMBEDDINGS_FILE, record)
    }

    pub(crate) fn replay(&self) -> Result<Vec<LogRecord>> {
        read_lines(&self.dir.join(ENTRIES_FILE))
    }

    pub(crate) fn replay_embeddings(&self) -> Result<Vec<EmbeddingRecord>> {
        read_lines(&self.dir.join(EMBEDDINGS_FILE))
    }

    fn append_line<T: Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let line = serde_json::to_string(value)?;
        let path = self.dir.join(file);
        let _guard = self
            .writer
            .lock()
            .map_err(|_| anyhow!("memory log writer poisoned"))?;
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(handle, "{line}")
            .with_context(|| format!("failed to append to {}", path.display()))?;
        handle.flush()?;
        Ok(())
    }
}

/// A crash can leave a partial last line; new records must not be glued onto it.
fn terminate_last_line(path: &Path) -> Result<()> {
    let Ok(contents) = std::fs::read(path) else {
        return Ok(());
    };
    if contents.last().is_some_and(|byte| *byte != b'\n') {
        let mut handle = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(handle)?;
    }
    Ok(())
}

/// Malformed lines (a torn final write) are skipped.
fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(err) => warn!(
                path = %path.display(),
                line = index + 1,
                error = %err,
                "skipping malformed memory log line"
            ),
        }
    }
    Ok(records)
}
