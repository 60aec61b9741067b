//! FinSight core: the agent runtime and the infrastructure around it.
//!
//! Agents run a think/act loop against an inference capability, invoke
//! registered capabilities or sandboxed Python, checkpoint every round and
//! share what they learn through a deduplicating memory. Stages of agent runs
//! are sequenced into a collection -> analysis -> report pipeline.

mod action;
mod agent;
mod capability;
mod checkpoint;
mod config;
mod error;
mod events;
mod llm;
mod logging;
mod memory;
mod metrics;
mod orchestrator;
mod persist;
mod refine;
mod sandbox;
mod security;
mod telemetry;
mod workflow;

#[cfg(test)]
pub(crate) mod test_support;

pub use action::{Action, parse_action};
pub use agent::{
    Actor, AgentRole, AgentRuntime, HistoryEntry, PROTECTED_PREFIX, RoleStrategy, RunStatus,
    RuntimeServices, RuntimeSettings, TaskFrame, TerminalResult,
};
pub use capability::{
    Capability, CapabilityError, CapabilityRegistry, DispatchFailure, InvocationContext, ParamSpec,
    ParamType, PluginReport, RateLimiter, RegistryError, RetryPolicy, ToolOutput,
};
pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, FsCheckpointStore, InMemoryCheckpointStore,
    StreamKey,
};
pub use config::{
    Config, ConfigLoader, EmbeddingConfig, LlmConfig, LoggingConfig, PipelineConfig,
    RefinementConfig, RetryConfig, RuntimeConfig, SandboxConfig,
};
pub use error::{FinsightError, RunError};
pub use events::{Event, EventCollector, TaskOutcome, TraceCollector};
pub use llm::{
    ChatMessage, ChatRole, InferenceClient, InferenceError, OpenAiClient, OpenAiEmbedder,
    OpenAiVision, complete_with_retry,
};
pub use logging::{PipelineLogInput, log_pipeline_completion, sanitize_text};
#[cfg(feature = "fastembed-embedder")]
pub use memory::FastEmbedder;
pub use memory::{
    Embedder, EntryKind, HashingEmbedder, MemoryDraft, MemoryEntry, MemoryLog, PutOutcome,
    SharedMemory, cosine_similarity,
};
pub use metrics::init_metrics_from_env;
pub use orchestrator::{
    OrchestratorConfig, SequentialStage, StageReport, StageRunner, StageTask, TaskReport,
};
pub use persist::sha256_hex;
pub use refine::{
    CHART_FILE, ChartArtifact, ChartRefiner, ChartRequest, CritiqueVerdict, RefinementOutcome,
    RefinementReport, VisionEvaluator,
};
pub use sandbox::{
    CodeSandbox, DockerRuntimeUser, DockerSandboxConfig, DockerSandboxRunner, ExecutionReport,
    Namespace, NamespaceSnapshot, SandboxExecutor, SandboxFile, SandboxOutput, SandboxOutputKind,
    SandboxOutputSpec, SandboxRequest, SandboxResult, VariableSummary,
};
pub use security::{SecretValue, require_env};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use workflow::{
    Figure, PipelineOptions, PipelineOutcome, ReportDocument, ReportSection, ResearchPlan, RoleSet,
    run_pipeline,
};
