//! Think/act loop shared by every agent role.

mod runtime;

pub use runtime::{AgentRuntime, RuntimeServices, RuntimeSettings};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::truncate;
use crate::llm::ChatMessage;
use crate::memory::{EntryKind, MemoryDraft};
use crate::persist::sha256_hex;

/// Number of leading request messages (system prompt and task framing) that
/// context-overflow recovery never drops.
pub const PROTECTED_PREFIX: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Collector,
    Analyzer,
    Generator,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Collector => "collector",
            AgentRole::Analyzer => "analyzer",
            AgentRole::Generator => "generator",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Initial framing of one agent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFrame {
    pub task_id: String,
    pub role: AgentRole,
    pub instruction: String,
    /// Material the run starts from (accepted sections, memory excerpts).
    #[serde(default)]
    pub context: Vec<String>,
    pub stream: String,
}

impl TaskFrame {
    pub fn new(task_id: impl Into<String>, role: AgentRole, instruction: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            role,
            instruction: instruction.into(),
            context: Vec::new(),
            stream: "main".to_string(),
        }
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.context = context;
        self
    }

    /// Stable run identity derived from role and task.
    pub fn identity(&self) -> String {
        let digest = sha256_hex(self.task_id.as_bytes());
        format!("{}-{}", self.role.as_str(), &digest[..12])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    System,
    User,
    Assistant,
    Observation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub actor: Actor,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub round: u32,
}

impl HistoryEntry {
    pub fn new(actor: Actor, content: impl Into<String>, round: u32) -> Self {
        Self {
            actor,
            content: content.into(),
            timestamp: Utc::now(),
            round,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TerminalResult {
    Final {
        payload: String,
        rounds: u32,
    },
    /// Round budget spent without a final action.
    BudgetExhausted {
        partial: Option<String>,
        rounds: u32,
    },
    Cancelled {
        rounds: u32,
    },
}

impl TerminalResult {
    pub fn payload(&self) -> Option<&str> {
        match self {
            TerminalResult::Final { payload, .. } => Some(payload),
            TerminalResult::BudgetExhausted { partial, .. } => partial.as_deref(),
            TerminalResult::Cancelled { .. } => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, TerminalResult::Final { .. })
    }

    pub fn rounds(&self) -> u32 {
        match self {
            TerminalResult::Final { rounds, .. }
            | TerminalResult::BudgetExhausted { rounds, .. }
            | TerminalResult::Cancelled { rounds } => *rounds,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TerminalResult::Final { .. } => "final",
            TerminalResult::BudgetExhausted { .. } => "budget_exhausted",
            TerminalResult::Cancelled { .. } => "cancelled",
        }
    }
}

/// Role-specific prompt building and action policy for the shared loop.
pub trait RoleStrategy: Send + Sync {
    fn role(&self) -> AgentRole;

    /// System prompt; `capabilities` is the registry description filtered
    /// through [`RoleStrategy::allows_capability`].
    fn system_prompt(&self, capabilities: &str) -> String;

    fn task_prompt(&self, frame: &TaskFrame) -> String {
        let mut prompt = frame.instruction.clone();
        if !frame.context.is_empty() {
            prompt.push_str("\n\nContext:\n");
            for item in &frame.context {
                prompt.push_str("- ");
                prompt.push_str(item);
                prompt.push('\n');
            }
        }
        prompt
    }

    /// System prompt and task framing first, then the run history.
    fn build_request(
        &self,
        frame: &TaskFrame,
        capabilities: &str,
        history: &[HistoryEntry],
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + PROTECTED_PREFIX);
        messages.push(ChatMessage::system(self.system_prompt(capabilities)));
        messages.push(ChatMessage::user(self.task_prompt(frame)));
        for entry in history {
            messages.push(match entry.actor {
                Actor::Assistant => ChatMessage::assistant(entry.content.clone()),
                Actor::System => ChatMessage::system(entry.content.clone()),
                Actor::User => ChatMessage::user(entry.content.clone()),
                Actor::Observation => ChatMessage::user(format!("Observation:\n{}", entry.content)),
            });
        }
        messages
    }

    fn allows_code(&self) -> bool {
        true
    }

    fn allows_capability(&self, _name: &str) -> bool {
        true
    }

    /// Memory entry recording the terminal result of a run, if any.
    fn absorb(&self, frame: &TaskFrame, identity: &str, result: &TerminalResult) -> Option<MemoryDraft> {
        let payload = result.payload()?;
        Some(MemoryDraft {
            kind: EntryKind::Finding,
            name: truncate(&frame.instruction, 120),
            description: format!("{} result for task {}", self.role(), frame.task_id),
            payload: serde_json::Value::String(payload.to_string()),
            source: identity.to_string(),
            task_id: frame.task_id.clone(),
        })
    }
}
