//! Event bus for explainability and run traces.
//!
//! The runtime and the stage orchestrator report lifecycle events here. A
//! dropped receiver never fails a run.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::persist::write_atomic;

pub type EventId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RunStarted {
        event_id: EventId,
        timestamp: i64,
        identity: String,
        stream: String,
        role: String,
        resumed_at_round: u32,
    },
    RoundCompleted {
        event_id: EventId,
        timestamp: i64,
        identity: String,
        stream: String,
        round: u32,
        action: String,
    },
    RunFinished {
        event_id: EventId,
        timestamp: i64,
        identity: String,
        stream: String,
        outcome: TaskOutcome,
        rounds: u32,
    },
    StageStarted {
        event_id: EventId,
        timestamp: i64,
        stage: String,
        tasks: usize,
    },
    StageFinished {
        event_id: EventId,
        timestamp: i64,
        stage: String,
        succeeded: usize,
        failed: usize,
        duration_ms: u64,
    },
}

impl Event {
    pub fn event_id(&self) -> &str {
        match self {
            Event::RunStarted { event_id, .. }
            | Event::RoundCompleted { event_id, .. }
            | Event::RunFinished { event_id, .. }
            | Event::StageStarted { event_id, .. }
            | Event::StageFinished { event_id, .. } => event_id,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Event::RunStarted { timestamp, .. }
            | Event::RoundCompleted { timestamp, .. }
            | Event::RunFinished { timestamp, .. }
            | Event::StageStarted { timestamp, .. }
            | Event::StageFinished { timestamp, .. } => *timestamp,
        }
    }
}

/// Outcome of one task or run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failure { reason: String, retryable: bool },
    Timeout,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }
}

#[derive(Clone)]
pub struct EventCollector {
    sender: mpsc::UnboundedSender<Event>,
}

impl EventCollector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn run_started(&self, identity: &str, stream: &str, role: &str, resumed_at_round: u32) {
        self.emit(Event::RunStarted {
            event_id: generate_event_id(),
            timestamp: now_millis(),
            identity: identity.to_string(),
            stream: stream.to_string(),
            role: role.to_string(),
            resumed_at_round,
        });
    }

    pub fn round_completed(&self, identity: &str, stream: &str, round: u32, action: &str) {
        self.emit(Event::RoundCompleted {
            event_id: generate_event_id(),
            timestamp: now_millis(),
            identity: identity.to_string(),
            stream: stream.to_string(),
            round,
            action: action.to_string(),
        });
    }

    pub fn run_finished(&self, identity: &str, stream: &str, outcome: TaskOutcome, rounds: u32) {
        self.emit(Event::RunFinished {
            event_id: generate_event_id(),
            timestamp: now_millis(),
            identity: identity.to_string(),
            stream: stream.to_string(),
            outcome,
            rounds,
        });
    }

    pub fn stage_started(&self, stage: &str, tasks: usize) {
        self.emit(Event::StageStarted {
            event_id: generate_event_id(),
            timestamp: now_millis(),
            stage: stage.to_string(),
            tasks,
        });
    }

    pub fn stage_finished(&self, stage: &str, succeeded: usize, failed: usize, duration_ms: u64) {
        self.emit(Event::StageFinished {
            event_id: generate_event_id(),
            timestamp: now_millis(),
            stage: stage.to_string(),
            succeeded,
            failed,
            duration_ms,
        });
    }

    fn emit(&self, event: Event) {
        if let Err(err) = self.sender.send(event) {
            tracing::debug!(event_id = %err.0.event_id(), "event receiver dropped");
        }
    }
}

impl Default for EventCollector {
    fn default() -> Self {
        Self::new().0
    }
}

fn generate_event_id() -> EventId {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("evt_{id}")
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Drains an event channel into memory and persists it as a JSON trace.
pub struct TraceCollector {
    receiver: mpsc::UnboundedReceiver<Event>,
    events: Vec<Event>,
}

impl TraceCollector {
    pub fn new(receiver: mpsc::UnboundedReceiver<Event>) -> Self {
        Self {
            receiver,
            events: Vec::new(),
        }
    }

    /// Collect until every sender is dropped.
    pub async fn collect(&mut self) {
        while let Some(event) = self.receiver.recv().await {
            tracing::trace!(event_id = %event.event_id(), "collected event");
            self.events.push(event);
        }
    }

    /// Take whatever is already queued without waiting.
    pub fn drain_ready(&mut self) {
        while let Ok(event) = self.receiver.try_recv() {
            self.events.push(event);
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_vec_pretty(&self.events).context("failed to encode trace")?;
        write_atomic(path, &body)
            .with_context(|| format!("failed to write trace {}", path.display()))
    }
}
