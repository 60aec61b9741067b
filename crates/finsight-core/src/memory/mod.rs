//! Cross-agent store of datasets, findings and charts.
//!
//! Entries are keyed by a content fingerprint. A second write of the same
//! content only merges provenance metadata into the existing entry.

mod embed;
#[cfg(feature = "fastembed-embedder")]
mod fastembed;
mod log;

pub use embed::{Embedder, HashingEmbedder, cosine_similarity};
#[cfg(feature = "fastembed-embedder")]
pub use fastembed::FastEmbedder;
pub use self::log::MemoryLog;

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::capability::{ToolOutput, truncate};
use crate::persist::sha256_hex;
use self::log::{EmbeddingRecord, LogRecord};

const EMBED_TEXT_LIMIT: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Dataset,
    Finding,
    Chart,
    Section,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Dataset => "dataset",
            EntryKind::Finding => "finding",
            EntryKind::Chart => "chart",
            EntryKind::Section => "section",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub fingerprint: String,
    pub kind: EntryKind,
    pub name: String,
    pub description: String,
    pub payload: Value,
    pub sources: Vec<String>,
    pub task_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub seq: u64,
    /// Cached lazily on first retrieval; persisted in the side index.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryEntry {
    fn embedding_text(&self) -> String {
        let payload = match &self.payload {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        format!(
            "{}\n{}\n{}",
            self.name,
            self.description,
            truncate(&payload, EMBED_TEXT_LIMIT)
        )
    }
}

/// A write request before fingerprinting.
#[derive(Debug, Clone)]
pub struct MemoryDraft {
    pub kind: EntryKind,
    pub name: String,
    pub description: String,
    pub payload: Value,
    pub source: String,
    pub task_id: String,
}

impl MemoryDraft {
    pub fn from_output(output: &ToolOutput, task_id: &str) -> Self {
        Self {
            kind: output.kind,
            name: output.name.clone(),
            description: output.description.clone(),
            payload: output.payload.clone(),
            source: output.source.clone(),
            task_id: task_id.to_string(),
        }
    }

    /// Stable hash over kind, normalised name and canonical payload.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::json!({
            "kind": self.kind.as_str(),
            "name": normalize_text(&self.name),
            "payload": canonicalize(&self.payload),
        });
        sha256_hex(canonical.to_string().as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted { fingerprint: String },
    Merged { fingerprint: String },
}

impl PutOutcome {
    pub fn fingerprint(&self) -> &str {
        match self {
            PutOutcome::Inserted { fingerprint } | PutOutcome::Merged { fingerprint } => fingerprint,
        }
    }
}

pub struct SharedMemory {
    entries: DashMap<String, MemoryEntry>,
    /// One writer per fingerprint; the log append happens under this lock,
    /// never under a map shard lock.
    writers: DashMap<String, Arc<Mutex<()>>>,
    next_seq: AtomicU64,
    embedder: Arc<dyn Embedder>,
    log: Option<MemoryLog>,
}

impl SharedMemory {
    /// Memory that lives only as long as the process.
    pub fn in_memory(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            entries: DashMap::new(),
            writers: DashMap::new(),
            next_seq: AtomicU64::new(0),
            embedder,
            log: None,
        }
    }

    /// Open (or create) a persisted memory and replay its log.
    pub fn open(log: MemoryLog, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let entries: DashMap<String, MemoryEntry> = DashMap::new();
        let mut max_seq = None;
        for record in log.replay()? {
            match record {
                LogRecord::Insert { entry } => {
                    max_seq = max_seq.max(Some(entry.seq));
                    entries.entry(entry.fingerprint.clone()).or_insert(entry);
                }
                LogRecord::Merge {
                    fingerprint,
                    source,
                    description,
                    task_id,
                } => {
                    if let Some(mut entry) = entries.get_mut(&fingerprint) {
                        merge_metadata(&mut entry, source, description, task_id);
                    }
                }
            }
        }
        for record in log.replay_embeddings()? {
            if let Some(mut entry) = entries.get_mut(&record.fingerprint) {
                entry.embedding = Some(record.vector);
            }
        }
        debug!(entries = entries.len(), dir = %log.dir().display(), "shared memory restored");
        Ok(Self {
            entries,
            writers: DashMap::new(),
            next_seq: AtomicU64::new(max_seq.map(|seq| seq + 1).unwrap_or(0)),
            embedder,
            log: Some(log),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert `draft`, or merge its provenance into the entry with the same fingerprint.
    ///
    /// Writers of one fingerprint are serialised; the change is logged before
    /// it becomes visible.
    #[instrument(skip(self, draft), fields(name = %draft.name, task_id = %draft.task_id))]
    pub fn put(&self, draft: MemoryDraft) -> Result<PutOutcome> {
        let fingerprint = draft.fingerprint();
        let writer = self.writers.entry(fingerprint.clone()).or_default().value().clone();
        let _writer = writer
            .lock()
            .map_err(|_| anyhow!("memory writer for {fingerprint} poisoned"))?;

        if self.entries.contains_key(&fingerprint) {
            if let Some(log) = &self.log {
                log.append(&LogRecord::Merge {
                    fingerprint: fingerprint.clone(),
                    source: Some(draft.source.clone()),
                    description: Some(draft.description.clone()),
                    task_id: Some(draft.task_id.clone()),
                })?;
            }
            if let Some(mut entry) = self.entries.get_mut(&fingerprint) {
                merge_metadata(&mut entry, Some(draft.source), Some(draft.description), Some(draft.task_id));
            }
            debug!(%fingerprint, "merged duplicate memory entry");
            return Ok(PutOutcome::Merged { fingerprint });
        }

        let entry = MemoryEntry {
            fingerprint: fingerprint.clone(),
            kind: draft.kind,
            name: draft.name,
            description: draft.description,
            payload: draft.payload,
            sources: vec![draft.source],
            task_ids: vec![draft.task_id],
            created_at: Utc::now(),
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            embedding: None,
        };
        if let Some(log) = &self.log {
            log.append(&LogRecord::Insert {
                entry: entry.clone(),
            })?;
        }
        self.entries.insert(fingerprint.clone(), entry);
        debug!(%fingerprint, "inserted memory entry");
        Ok(PutOutcome::Inserted { fingerprint })
    }

    pub fn get(&self, fingerprint: &str) -> Option<MemoryEntry> {
        self.entries.get(fingerprint).map(|entry| entry.clone())
    }

    /// Entries written (or merged) by `task_id`, oldest first.
    pub fn get_by_task(&self, task_id: &str) -> Vec<MemoryEntry> {
        self.collect_sorted(|entry| entry.task_ids.iter().any(|id| id == task_id))
    }

    pub fn by_kind(&self, kind: EntryKind) -> Vec<MemoryEntry> {
        self.collect_sorted(|entry| entry.kind == kind)
    }

    pub fn all(&self) -> Vec<MemoryEntry> {
        self.collect_sorted(|_| true)
    }

    fn collect_sorted(&self, keep: impl Fn(&MemoryEntry) -> bool) -> Vec<MemoryEntry> {
        let mut out: Vec<MemoryEntry> = self
            .entries
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by_key(|entry| entry.seq);
        out
    }

    /// Up to `top_k` entries ordered by descending cosine similarity to `query`.
    ///
    /// Ties go to the most recently created entry.
    #[instrument(skip(self))]
    pub async fn retrieve_relevant(&self, query: &str, top_k: usize) -> Result<Vec<MemoryEntry>> {
        if top_k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }
        self.fill_missing_embeddings().await?;

        let query_vector = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let mut scored: Vec<(f32, MemoryEntry)> = self
            .entries
            .iter()
            .map(|entry| {
                let score = entry
                    .embedding
                    .as_deref()
                    .map(|vector| cosine_similarity(&query_vector, vector))
                    .unwrap_or(0.0);
                (score, entry.value().clone())
            })
            .collect();

        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(CmpOrdering::Equal)
                .then_with(|| b.seq.cmp(&a.seq))
        });

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(_, entry)| entry)
            .collect())
    }

    async fn fill_missing_embeddings(&self) -> Result<()> {
        let pending: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|entry| entry.embedding.is_none())
            .map(|entry| (entry.fingerprint.clone(), entry.embedding_text()))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = pending.iter().map(|(_, text)| text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;
        for ((fingerprint, _), vector) in pending.into_iter().zip(vectors) {
            if let Some(log) = &self.log {
                log.append_embedding(&EmbeddingRecord {
                    fingerprint: fingerprint.clone(),
                    vector: vector.clone(),
                })?;
            }
            if let Some(mut entry) = self.entries.get_mut(&fingerprint) {
                entry.embedding.get_or_insert(vector);
            }
        }
        Ok(())
    }
}

fn merge_metadata(
    entry: &mut MemoryEntry,
    source: Option<String>,
    description: Option<String>,
    task_id: Option<String>,
) {
    if let Some(source) = source
        && !source.is_empty()
        && !entry.sources.contains(&source)
    {
        entry.sources.push(source);
    }
    if let Some(task_id) = task_id
        && !entry.task_ids.contains(&task_id)
    {
        entry.task_ids.push(task_id);
    }
    if let Some(description) = description
        && entry.description.trim().is_empty()
    {
        entry.description = description;
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Sorted keys and trimmed strings, so formatting differences do not change the hash.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::String(text) => Value::String(text.trim().to_string()),
        other => other.clone(),
    }
}
