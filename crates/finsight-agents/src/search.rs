//! `memory_search`: semantic lookup over the shared memory.

use std::sync::Arc;

use async_trait::async_trait;
use finsight_core::{
    Capability, CapabilityError, InvocationContext, ParamSpec, ParamType, SharedMemory, ToolOutput,
};
use serde_json::{Map, Value};
use tracing::debug;

pub const MEMORY_SEARCH: &str = "memory_search";

const DEFAULT_TOP_K: usize = 5;
const MAX_TOP_K: usize = 20;

/// Returns stored entries unchanged, with their original source, so that
/// re-recording a search hit only merges into the entry it came from.
pub struct MemorySearch {
    memory: Arc<SharedMemory>,
}

impl MemorySearch {
    pub fn new(memory: Arc<SharedMemory>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Capability for MemorySearch {
    fn name(&self) -> &str {
        MEMORY_SEARCH
    }

    fn description(&self) -> &str {
        "Search the datasets, findings, charts and sections recorded so far"
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("query", ParamType::String).describe("what to look for"),
            ParamSpec::optional("top_k", ParamType::Integer)
                .describe(format!("number of hits, default {DEFAULT_TOP_K}, at most {MAX_TOP_K}")),
        ]
    }

    fn category(&self) -> &str {
        "memory"
    }

    async fn invoke(
        &self,
        args: &Map<String, Value>,
        _ctx: &InvocationContext<'_>,
    ) -> Result<Vec<ToolOutput>, CapabilityError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|query| !query.is_empty())
            .ok_or_else(|| CapabilityError::InvalidInput("query must not be empty".into()))?;
        let top_k = args
            .get("top_k")
            .and_then(Value::as_u64)
            .map(|k| (k as usize).clamp(1, MAX_TOP_K))
            .unwrap_or(DEFAULT_TOP_K);

        let hits = self.memory.retrieve_relevant(query, top_k).await?;
        debug!(query, hits = hits.len(), "memory search");
        Ok(hits
            .into_iter()
            .map(|entry| ToolOutput {
                source: entry.sources.first().cloned().unwrap_or_default(),
                name: entry.name,
                description: entry.description,
                payload: entry.payload,
                kind: entry.kind,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finsight_core::{EntryKind, HashingEmbedder, MemoryDraft, PutOutcome};
    use serde_json::json;

    fn memory() -> Arc<SharedMemory> {
        Arc::new(SharedMemory::in_memory(Arc::new(HashingEmbedder::default())))
    }

    fn draft(name: &str, payload: Value, source: &str) -> MemoryDraft {
        MemoryDraft {
            kind: EntryKind::Dataset,
            name: name.into(),
            description: format!("{name} dataset"),
            payload,
            source: source.into(),
            task_id: "run-1:collect:0".into(),
        }
    }

    #[tokio::test]
    async fn hits_merge_back_into_their_entry() {
        let memory = memory();
        memory
            .put(draft("ACME revenue by year", json!([1, 2, 3]), "edgar"))
            .unwrap();
        memory
            .put(draft("ACME share price", json!({"close": 41.5}), "yahoo"))
            .unwrap();

        let search = MemorySearch::new(memory.clone());
        let mut args = Map::new();
        args.insert("query".into(), json!("ACME revenue"));
        args.insert("top_k".into(), json!(1));
        let outputs = search
            .invoke(&args, &InvocationContext::new("analyzer-1", "run-1:analyze:0"))
            .await
            .unwrap();

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].source, "edgar");
        let stored = MemoryDraft::from_output(&outputs[0], "run-1:analyze:0");
        assert!(matches!(memory.put(stored).unwrap(), PutOutcome::Merged { .. }));
        assert_eq!(memory.len(), 2);
    }

    #[tokio::test]
    async fn blank_queries_are_rejected() {
        let search = MemorySearch::new(memory());
        let mut args = Map::new();
        args.insert("query".into(), json!("   "));
        let err = search
            .invoke(&args, &InvocationContext::new("analyzer-1", "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidInput(_)));
    }
}
