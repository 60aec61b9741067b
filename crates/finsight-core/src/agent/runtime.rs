use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{
    Actor, HistoryEntry, PROTECTED_PREFIX, RoleStrategy, RunStatus, TaskFrame, TerminalResult,
};
use crate::action::{Action, parse_action};
use crate::capability::{CapabilityRegistry, InvocationContext, RetryPolicy};
use crate::checkpoint::{Checkpoint, CheckpointStore, StreamKey};
use crate::error::RunError;
use crate::events::{EventCollector, TaskOutcome};
use crate::llm::{InferenceClient, InferenceError, complete_with_retry};
use crate::memory::{MemoryDraft, SharedMemory};
use crate::metrics::record_round;
use crate::sandbox::{CodeSandbox, Namespace};

/// Shared collaborators handed to every run in a pipeline.
#[derive(Clone)]
pub struct RuntimeServices {
    pub inference: Arc<dyn InferenceClient>,
    pub capabilities: Arc<CapabilityRegistry>,
    /// `None` disables code actions; they come back as observations.
    pub sandbox: Option<CodeSandbox>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub memory: Arc<SharedMemory>,
    pub events: EventCollector,
    pub namespace_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub max_rounds: u32,
    pub resume: bool,
    pub retry: RetryPolicy,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            max_rounds: 20,
            resume: false,
            retry: RetryPolicy::default(),
        }
    }
}

struct RoundOutcome {
    entries: Vec<HistoryEntry>,
    action: &'static str,
    final_payload: Option<String>,
}

/// One agent run: a sequence of think/act rounds over a single stream.
pub struct AgentRuntime {
    strategy: Arc<dyn RoleStrategy>,
    services: RuntimeServices,
    settings: RuntimeSettings,
    frame: TaskFrame,
    identity: String,
    key: StreamKey,
    capabilities: String,
    round: u32,
    version: u64,
    status: RunStatus,
    history: Vec<HistoryEntry>,
    namespace: Option<Namespace>,
    result: Option<TerminalResult>,
}

impl AgentRuntime {
    /// Build a run, restoring the latest checkpoint of its stream when
    /// `settings.resume` is set. A fresh start ignores existing checkpoints
    /// without deleting them; its versions continue after theirs.
    pub async fn prepare(
        strategy: Arc<dyn RoleStrategy>,
        services: RuntimeServices,
        settings: RuntimeSettings,
        frame: TaskFrame,
    ) -> Result<Self, RunError> {
        let identity = frame.identity();
        let key = StreamKey::new(identity.clone(), frame.stream.clone());
        let capabilities = services
            .capabilities
            .describe(|name| strategy.allows_capability(name));

        let latest = services
            .checkpoints
            .load_latest(&key)
            .await
            .map_err(|source| RunError::CheckpointRead {
                identity: identity.clone(),
                stream: frame.stream.clone(),
                source,
            })?;

        let mut runtime = Self {
            strategy,
            services,
            settings,
            frame,
            identity,
            key,
            capabilities,
            round: 0,
            version: latest.as_ref().map(|checkpoint| checkpoint.version).unwrap_or(0),
            status: RunStatus::Running,
            history: Vec::new(),
            namespace: None,
            result: None,
        };

        if runtime.settings.resume
            && let Some(checkpoint) = latest
        {
            runtime.restore(checkpoint)?;
        }
        Ok(runtime)
    }

    fn restore(&mut self, checkpoint: Checkpoint) -> Result<(), RunError> {
        if let Some(snapshot) = &checkpoint.namespace {
            let namespace = Namespace::restore(&self.services.namespace_root, &self.namespace_id(), snapshot)
                .map_err(|source| RunError::Namespace {
                    identity: self.identity.clone(),
                    source,
                })?;
            self.namespace = Some(namespace);
        }
        info!(
            run_id = %self.identity,
            stream = %self.key.stream,
            round = checkpoint.round,
            version = checkpoint.version,
            "resuming from checkpoint"
        );
        self.round = checkpoint.round;
        self.status = checkpoint.status;
        self.history = checkpoint.history;
        self.result = checkpoint.result;
        Ok(())
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn stream(&self) -> &str {
        &self.key.stream
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    fn namespace_id(&self) -> String {
        format!("{}-{}", self.identity, self.key.stream)
    }

    /// Drive rounds until a final action, the round budget, cancellation, or
    /// a fatal error. A run whose checkpoint already holds a terminal result
    /// returns it without doing any work.
    #[instrument(skip_all, fields(run_id = %self.identity, stream = %self.key.stream))]
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<TerminalResult, RunError> {
        let role = self.strategy.role();
        self.services
            .events
            .run_started(&self.identity, &self.key.stream, role.as_str(), self.round);

        if let Some(result) = self.result.clone() {
            debug!(outcome = result.label(), "run already terminal; replaying stored result");
            self.absorb(&result);
            self.finish_event(&result);
            return Ok(result);
        }

        loop {
            if self.round >= self.settings.max_rounds {
                let result = TerminalResult::BudgetExhausted {
                    partial: self.best_partial(),
                    rounds: self.round,
                };
                warn!(rounds = self.round, "round budget exhausted without a final answer");
                return self.conclude(result).await;
            }
            if cancel.is_cancelled() {
                return Ok(self.cancelled());
            }

            let round = self.round + 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = self.play_round(round) => Some(outcome),
            };
            let Some(outcome) = outcome else {
                debug!(round, "round abandoned on cancellation");
                return Ok(self.cancelled());
            };
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.status = RunStatus::Failed;
                    return Err(err);
                }
            };

            self.history.extend(outcome.entries);
            self.round = round;
            record_round(role.as_str(), outcome.action);
            self.services
                .events
                .round_completed(&self.identity, &self.key.stream, round, outcome.action);

            if let Some(payload) = outcome.final_payload {
                let result = TerminalResult::Final {
                    payload,
                    rounds: round,
                };
                return self.conclude(result).await;
            }
            self.write_checkpoint().await?;
        }
    }

    async fn conclude(&mut self, result: TerminalResult) -> Result<TerminalResult, RunError> {
        self.status = RunStatus::Finished;
        self.result = Some(result.clone());
        self.write_checkpoint().await?;
        self.absorb(&result);
        self.finish_event(&result);
        info!(outcome = result.label(), rounds = result.rounds(), "run finished");
        Ok(result)
    }

    fn cancelled(&self) -> TerminalResult {
        let result = TerminalResult::Cancelled { rounds: self.round };
        self.finish_event(&result);
        result
    }

    async fn write_checkpoint(&mut self) -> Result<(), RunError> {
        let checkpoint = Checkpoint {
            version: self.version + 1,
            name: self.key.stream.clone(),
            round: self.round,
            status: self.status,
            history: self.history.clone(),
            namespace: self.namespace.as_ref().and_then(Namespace::snapshot),
            result: self.result.clone(),
            created_at: Utc::now(),
        };
        if let Err(source) = self.services.checkpoints.save(&self.key, &checkpoint).await {
            self.status = RunStatus::Failed;
            return Err(RunError::CheckpointWrite {
                identity: self.identity.clone(),
                stream: self.key.stream.clone(),
                source,
            });
        }
        self.version = checkpoint.version;
        Ok(())
    }

    fn finish_event(&self, result: &TerminalResult) {
        let outcome = match result {
            TerminalResult::Final { .. } => TaskOutcome::Success,
            TerminalResult::BudgetExhausted { .. } => TaskOutcome::Failure {
                reason: "round budget exhausted".to_string(),
                retryable: false,
            },
            TerminalResult::Cancelled { .. } => TaskOutcome::Failure {
                reason: "cancelled".to_string(),
                retryable: true,
            },
        };
        self.services
            .events
            .run_finished(&self.identity, &self.key.stream, outcome, result.rounds());
    }

    fn absorb(&self, result: &TerminalResult) {
        let Some(draft) = self.strategy.absorb(&self.frame, &self.identity, result) else {
            return;
        };
        if let Err(err) = self.services.memory.put(draft) {
            warn!(error = %err, "failed to record run result in shared memory");
        }
    }

    /// Last successful observation, else the last model reply.
    fn best_partial(&self) -> Option<String> {
        self.history
            .iter()
            .rev()
            .find(|entry| {
                entry.actor == Actor::Observation
                    && (entry.content.starts_with("Execution succeeded")
                        || entry.content.starts_with("Tool result"))
            })
            .or_else(|| {
                self.history
                    .iter()
                    .rev()
                    .find(|entry| entry.actor == Actor::Assistant)
            })
            .map(|entry| entry.content.clone())
    }

    #[instrument(skip(self), fields(run_id = %self.identity))]
    async fn play_round(&mut self, round: u32) -> Result<RoundOutcome, RunError> {
        let messages = self
            .strategy
            .build_request(&self.frame, &self.capabilities, &self.history);

        let reply = match complete_with_retry(
            self.services.inference.as_ref(),
            &messages,
            &self.settings.retry,
            PROTECTED_PREFIX,
        )
        .await
        {
            Ok(reply) => reply,
            Err(InferenceError::Auth(message)) => return Err(RunError::Inference(message)),
            Err(err) => {
                warn!(round, error = %err, "inference failed; recording as observation");
                return Ok(RoundOutcome {
                    entries: vec![HistoryEntry::new(
                        Actor::Observation,
                        format!("Inference request failed: {err}"),
                        round,
                    )],
                    action: "inference_error",
                    final_payload: None,
                });
            }
        };

        let action = parse_action(&reply);
        let label = action.label();
        let mut entries = vec![HistoryEntry::new(Actor::Assistant, reply, round)];
        let mut final_payload = None;

        let observation = match action {
            Action::Final { payload } => {
                final_payload = Some(payload);
                None
            }
            Action::ToolCall { name, arguments } => Some(self.call_capability(&name, &arguments).await),
            Action::CodeExec { code } => Some(self.execute_code(&code).await?),
            Action::Unrecognized { reason } => Some(format!(
                "No executable action found: {reason}. Respond with exactly one <execute>, \
                 <tool_call> or <final_result> block."
            )),
        };
        if let Some(observation) = observation {
            entries.push(HistoryEntry::new(Actor::Observation, observation, round));
        }

        Ok(RoundOutcome {
            entries,
            action: label,
            final_payload,
        })
    }

    async fn call_capability(
        &self,
        name: &str,
        arguments: &serde_json::Map<String, serde_json::Value>,
    ) -> String {
        if !self.strategy.allows_capability(name) {
            return format!(
                "Capability '{name}' is not available to the {} role.",
                self.strategy.role()
            );
        }

        let mut ctx = InvocationContext::new(&self.identity, &self.frame.task_id);
        if let Some(namespace) = &self.namespace {
            ctx = ctx.with_namespace(namespace);
        }

        match self.services.capabilities.invoke(name, arguments, &ctx).await {
            Ok(outputs) => {
                let mut observation = format!("Tool result from {name}:");
                if outputs.is_empty() {
                    observation.push_str("\n(no output)");
                }
                for output in &outputs {
                    observation.push('\n');
                    observation.push_str(&output.preview());
                    if let Err(err) = self
                        .services
                        .memory
                        .put(MemoryDraft::from_output(output, &self.frame.task_id))
                    {
                        warn!(capability = name, error = %err, "failed to store capability output");
                        observation.push_str("\n(note: output could not be stored in shared memory)");
                    }
                }
                observation
            }
            Err(failure) => format!("Tool call failed: {failure}"),
        }
    }

    async fn execute_code(&mut self, code: &str) -> Result<String, RunError> {
        if !self.strategy.allows_code() {
            return Ok(format!(
                "Code execution is not available to the {} role.",
                self.strategy.role()
            ));
        }
        let Some(sandbox) = self.services.sandbox.clone() else {
            return Ok("Code execution is not available in this run.".to_string());
        };

        if self.namespace.is_none() {
            let namespace = Namespace::create(&self.services.namespace_root, &self.namespace_id())
                .map_err(|source| RunError::Namespace {
                    identity: self.identity.clone(),
                    source,
                })?;
            self.namespace = Some(namespace);
        }
        let Some(namespace) = self.namespace.as_mut() else {
            return Ok("Code execution is not available in this run.".to_string());
        };

        match sandbox.run(namespace, code, &[]).await {
            Ok(report) => Ok(report.to_observation()),
            Err(err) => {
                warn!(error = %err, "sandbox unavailable");
                Ok(format!("Execution failed\nError:\nsandbox unavailable: {err:#}"))
            }
        }
    }
}
