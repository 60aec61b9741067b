use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use finsight_core::{
    Actor, AgentRole, AgentRuntime, Capability, CapabilityError, CapabilityRegistry, ChatMessage,
    Checkpoint, CheckpointError, CheckpointStore, EntryKind, EventCollector, HashingEmbedder,
    InMemoryCheckpointStore, InferenceClient, InferenceError, InvocationContext, ParamSpec,
    ParamType, RetryPolicy, RoleStrategy, RunError, RunStatus, RuntimeServices, RuntimeSettings,
    SharedMemory, StreamKey, TaskFrame, TerminalResult, ToolOutput,
};
use serde_json::{Map, Value, json};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct ScriptedInference {
    replies: Mutex<VecDeque<Result<String, InferenceError>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedInference {
    fn new(replies: Vec<Result<String, InferenceError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn replies(texts: &[&str]) -> Arc<Self> {
        Self::new(texts.iter().map(|text| Ok(text.to_string())).collect())
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, InferenceError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(InferenceError::Invalid("script exhausted".into())))
    }
}

/// Returns a one-row balance sheet; the provider argument becomes the source.
#[derive(Default)]
struct FetchStatement {
    calls: AtomicUsize,
}

#[async_trait]
impl Capability for FetchStatement {
    fn name(&self) -> &str {
        "fetch_statement"
    }

    fn description(&self) -> &str {
        "Fetch a financial statement for a ticker"
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("ticker", ParamType::String),
            ParamSpec::optional("provider", ParamType::String),
        ]
    }

    async fn invoke(
        &self,
        args: &Map<String, Value>,
        _ctx: &InvocationContext<'_>,
    ) -> Result<Vec<ToolOutput>, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ticker = args["ticker"].as_str().unwrap_or_default();
        let provider = args
            .get("provider")
            .and_then(Value::as_str)
            .unwrap_or("edgar");
        Ok(vec![ToolOutput::new(
            format!("balance sheet for {ticker}"),
            "Annual balance sheet",
            json!([{"year": 2024, "total_assets": 1200, "total_liabilities": 700}]),
            provider,
        )])
    }
}

/// Signals once it is invoked, then never returns.
#[derive(Default)]
struct StalledQuote {
    entered: Notify,
}

#[async_trait]
impl Capability for StalledQuote {
    fn name(&self) -> &str {
        "live_quote"
    }

    fn description(&self) -> &str {
        "Stream a live quote"
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::optional("ticker", ParamType::String)]
    }

    async fn invoke(
        &self,
        _args: &Map<String, Value>,
        _ctx: &InvocationContext<'_>,
    ) -> Result<Vec<ToolOutput>, CapabilityError> {
        self.entered.notify_one();
        std::future::pending().await
    }
}

struct Collector;

impl RoleStrategy for Collector {
    fn role(&self) -> AgentRole {
        AgentRole::Collector
    }

    fn system_prompt(&self, capabilities: &str) -> String {
        format!("Collect data.\n{capabilities}")
    }
}

/// Delegates to an in-memory store but refuses every save.
#[derive(Default)]
struct ReadOnlyStore {
    inner: InMemoryCheckpointStore,
}

#[async_trait]
impl CheckpointStore for ReadOnlyStore {
    async fn save(&self, key: &StreamKey, _checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        Err(CheckpointError::Persist {
            path: format!("/readonly/{key}").into(),
            source: anyhow::anyhow!("disk full"),
        })
    }

    async fn load_latest(&self, key: &StreamKey) -> Result<Option<Checkpoint>, CheckpointError> {
        self.inner.load_latest(key).await
    }

    async fn streams(&self, identity: &str) -> Result<Vec<String>, CheckpointError> {
        self.inner.streams(identity).await
    }
}

const FETCH_X: &str =
    r#"<tool_call>{"name": "fetch_statement", "arguments": {"ticker": "XYZ"}}</tool_call>"#;
const DONE: &str = "<final_result>XYZ balance sheet collected</final_result>";

struct Harness {
    capability: Arc<FetchStatement>,
    registry: Arc<CapabilityRegistry>,
    memory: Arc<SharedMemory>,
}

impl Harness {
    fn new() -> Self {
        let capability = Arc::new(FetchStatement::default());
        let mut registry = CapabilityRegistry::new(RetryPolicy::immediate(1));
        registry.register(capability.clone()).unwrap();
        Self {
            capability,
            registry: Arc::new(registry),
            memory: Arc::new(SharedMemory::in_memory(Arc::new(HashingEmbedder::default()))),
        }
    }

    fn services(
        &self,
        inference: Arc<dyn InferenceClient>,
        checkpoints: Arc<dyn CheckpointStore>,
        root: &Path,
    ) -> RuntimeServices {
        let (events, _receiver) = EventCollector::new();
        RuntimeServices {
            inference,
            capabilities: self.registry.clone(),
            sandbox: None,
            checkpoints,
            memory: self.memory.clone(),
            events,
            namespace_root: root.to_path_buf(),
        }
    }

    fn invocations(&self) -> usize {
        self.capability.calls.load(Ordering::SeqCst)
    }
}

fn settings(max_rounds: u32, resume: bool) -> RuntimeSettings {
    RuntimeSettings {
        max_rounds,
        resume,
        retry: RetryPolicy::immediate(1),
    }
}

fn frame() -> TaskFrame {
    TaskFrame::new("collect-xyz", AgentRole::Collector, "Collect the XYZ balance sheet")
}

async fn run(
    services: RuntimeServices,
    settings: RuntimeSettings,
    frame: TaskFrame,
) -> (Result<TerminalResult, RunError>, AgentRuntime) {
    let mut runtime = AgentRuntime::prepare(Arc::new(Collector), services, settings, frame)
        .await
        .unwrap();
    let result = runtime.run(&CancellationToken::new()).await;
    (result, runtime)
}

#[tokio::test]
async fn resuming_a_finished_run_replays_its_result() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());

    let first = ScriptedInference::replies(&[FETCH_X, DONE]);
    let (result, _) = run(harness.services(first, store.clone(), dir.path()), settings(10, false), frame()).await;
    let result = result.unwrap();
    assert_eq!(
        result,
        TerminalResult::Final {
            payload: "XYZ balance sheet collected".into(),
            rounds: 2
        }
    );
    assert_eq!(harness.invocations(), 1);

    let second = ScriptedInference::replies(&[]);
    let (replayed, runtime) =
        run(harness.services(second.clone(), store, dir.path()), settings(10, true), frame()).await;
    assert_eq!(replayed.unwrap(), result);
    assert_eq!(second.calls(), 0);
    assert_eq!(harness.invocations(), 1);
    assert_eq!(runtime.status(), RunStatus::Finished);
}

#[tokio::test]
async fn crash_after_round_three_resumes_at_round_four() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let store = Arc::new(InMemoryCheckpointStore::new());

    let crashing = ScriptedInference::new(vec![
        Ok(FETCH_X.to_string()),
        Ok(FETCH_X.to_string()),
        Ok(FETCH_X.to_string()),
        Err(InferenceError::Auth("key revoked".into())),
    ]);
    let (result, runtime) =
        run(harness.services(crashing, store.clone(), dir.path()), settings(10, false), frame()).await;
    assert!(matches!(result, Err(RunError::Inference(_))));
    assert_eq!(runtime.status(), RunStatus::Failed);
    assert_eq!(harness.invocations(), 3);

    let key = StreamKey::new(frame().identity(), "main");
    let latest = store.load_latest(&key).await.unwrap().unwrap();
    assert_eq!(latest.round, 3);
    assert_eq!(store.count(&key), 3);

    let resumed = ScriptedInference::replies(&[DONE]);
    let (result, runtime) =
        run(harness.services(resumed.clone(), store.clone(), dir.path()), settings(10, true), frame()).await;
    assert_eq!(
        result.unwrap(),
        TerminalResult::Final {
            payload: "XYZ balance sheet collected".into(),
            rounds: 4
        }
    );
    assert_eq!(harness.invocations(), 3);

    // System prompt, task framing, then three rounds of call + observation.
    let requests = resumed.requests.lock().unwrap();
    assert_eq!(requests[0].len(), 2 + 6);
    let rounds: Vec<u32> = runtime.history().iter().map(|entry| entry.round).collect();
    assert_eq!(rounds, vec![1, 1, 2, 2, 3, 3, 4]);
}

#[tokio::test]
async fn failed_checkpoint_write_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let inference = ScriptedInference::replies(&[FETCH_X, DONE]);

    let (result, runtime) = run(
        harness.services(inference.clone(), Arc::new(ReadOnlyStore::default()), dir.path()),
        settings(10, false),
        frame(),
    )
    .await;

    assert!(matches!(result, Err(RunError::CheckpointWrite { .. })));
    assert_eq!(runtime.status(), RunStatus::Failed);
    // Round two never starts.
    assert_eq!(inference.calls(), 1);
}

#[tokio::test]
async fn unrecognized_reply_becomes_an_observation() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let inference = ScriptedInference::replies(&["Revenue looks strong this year.", DONE]);

    let (result, runtime) = run(
        harness.services(inference, Arc::new(InMemoryCheckpointStore::new()), dir.path()),
        settings(10, false),
        frame(),
    )
    .await;

    assert!(result.unwrap().is_final());
    let observation = &runtime.history()[1];
    assert_eq!(observation.actor, Actor::Observation);
    assert!(observation.content.starts_with("No executable action found"));
}

#[tokio::test]
async fn invalid_arguments_are_reported_without_invoking() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let inference = ScriptedInference::replies(&[
        r#"<tool_call>{"name": "fetch_statement", "arguments": {}}</tool_call>"#,
        r#"<tool_call>{"name": "fetch_quotes", "arguments": {}}</tool_call>"#,
        DONE,
    ]);

    let (result, runtime) = run(
        harness.services(inference, Arc::new(InMemoryCheckpointStore::new()), dir.path()),
        settings(10, false),
        frame(),
    )
    .await;

    assert!(result.unwrap().is_final());
    assert_eq!(harness.invocations(), 0);
    let history = runtime.history();
    assert!(history[1].content.contains("missing required argument 'ticker'"));
    assert!(history[3].content.contains("unknown capability"));
}

#[tokio::test]
async fn exhausted_budget_returns_the_last_tool_result() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let inference = ScriptedInference::replies(&[FETCH_X, "still thinking"]);
    let store = Arc::new(InMemoryCheckpointStore::new());

    let (result, _) = run(harness.services(inference, store.clone(), dir.path()), settings(2, false), frame()).await;

    match result.unwrap() {
        TerminalResult::BudgetExhausted { partial, rounds } => {
            assert_eq!(rounds, 2);
            assert!(partial.unwrap().starts_with("Tool result from fetch_statement"));
        }
        other => panic!("unexpected result {other:?}"),
    }
    let key = StreamKey::new(frame().identity(), "main");
    let latest = store.load_latest(&key).await.unwrap().unwrap();
    assert_eq!(latest.status, RunStatus::Finished);
    assert!(latest.result.is_some());
}

#[tokio::test]
async fn fresh_start_ignores_but_keeps_old_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let store = Arc::new(InMemoryCheckpointStore::new());
    let key = StreamKey::new(frame().identity(), "main");

    let first = ScriptedInference::replies(&[DONE]);
    run(harness.services(first, store.clone(), dir.path()), settings(5, false), frame())
        .await
        .0
        .unwrap();
    assert_eq!(store.count(&key), 1);

    let second = ScriptedInference::replies(&[DONE]);
    let (result, _) = run(harness.services(second.clone(), store.clone(), dir.path()), settings(5, false), frame()).await;
    assert!(result.unwrap().is_final());
    assert_eq!(second.calls(), 1);
    assert_eq!(store.count(&key), 2);
    assert_eq!(store.load_latest(&key).await.unwrap().unwrap().version, 2);
}

#[tokio::test]
async fn concurrent_collectors_share_one_deduplicated_entry() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());

    let call = |provider: &str| {
        format!(
            r#"<tool_call>{{"name": "fetch_statement", "arguments": {{"ticker": "XYZ", "provider": "{provider}"}}}}</tool_call>"#
        )
    };
    let a = ScriptedInference::new(vec![Ok(call("edgar")), Ok(DONE.to_string())]);
    let b = ScriptedInference::new(vec![Ok(call("yahoo")), Ok(DONE.to_string())]);

    let frame_a = TaskFrame::new("collect-a", AgentRole::Collector, "Balance sheet for ticker XYZ");
    let frame_b = TaskFrame::new("collect-b", AgentRole::Collector, "Balance sheet for ticker XYZ");
    let (ra, rb) = tokio::join!(
        run(harness.services(a, store.clone(), dir.path()), settings(5, false), frame_a),
        run(harness.services(b, store.clone(), dir.path()), settings(5, false), frame_b),
    );
    assert!(ra.0.unwrap().is_final());
    assert!(rb.0.unwrap().is_final());

    let datasets = harness.memory.by_kind(EntryKind::Dataset);
    assert_eq!(datasets.len(), 1);
    let mut sources = datasets[0].sources.clone();
    sources.sort();
    assert_eq!(sources, vec!["edgar".to_string(), "yahoo".to_string()]);
    assert_eq!(datasets[0].task_ids.len(), 2);
}

#[tokio::test]
async fn cancellation_before_a_round_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let store = Arc::new(InMemoryCheckpointStore::new());
    let inference = ScriptedInference::replies(&[DONE]);
    let token = CancellationToken::new();
    token.cancel();

    let mut runtime = AgentRuntime::prepare(
        Arc::new(Collector),
        harness.services(inference.clone(), store.clone(), dir.path()),
        settings(5, false),
        frame(),
    )
    .await
    .unwrap();
    let result = runtime.run(&token).await.unwrap();

    assert_eq!(result, TerminalResult::Cancelled { rounds: 0 });
    assert_eq!(inference.calls(), 0);
    assert_eq!(store.count(&StreamKey::new(frame().identity(), "main")), 0);
}

#[tokio::test]
async fn cancellation_mid_round_keeps_the_previous_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let stalled = Arc::new(StalledQuote::default());
    let mut registry = CapabilityRegistry::new(RetryPolicy::immediate(1));
    registry.register(harness.capability.clone()).unwrap();
    registry.register(stalled.clone()).unwrap();

    let store = Arc::new(InMemoryCheckpointStore::new());
    let inference = ScriptedInference::replies(&[
        FETCH_X,
        r#"<tool_call>{"name": "live_quote", "arguments": {"ticker": "XYZ"}}</tool_call>"#,
        DONE,
    ]);
    let mut services = harness.services(inference.clone(), store.clone(), dir.path());
    services.capabilities = Arc::new(registry);
    let mut runtime = AgentRuntime::prepare(Arc::new(Collector), services, settings(5, false), frame())
        .await
        .unwrap();

    let token = CancellationToken::new();
    let canceller = async {
        stalled.entered.notified().await;
        token.cancel();
    };
    let (result, ()) = tokio::join!(runtime.run(&token), canceller);

    assert_eq!(result.unwrap(), TerminalResult::Cancelled { rounds: 1 });
    assert_eq!(inference.calls(), 2);
    let key = StreamKey::new(frame().identity(), "main");
    assert_eq!(store.count(&key), 1);
    let latest = store.load_latest(&key).await.unwrap().unwrap();
    assert_eq!(latest.round, 1);
    assert_eq!(latest.status, RunStatus::Running);
    assert!(latest.result.is_none());
    assert_eq!(store.streams(&frame().identity()).await.unwrap(), vec!["main".to_string()]);
    assert_eq!(runtime.round(), 1);
}
