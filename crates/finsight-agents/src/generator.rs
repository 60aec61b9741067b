//! Report generator role: drafts the outline, then writes one section per run.

use finsight_core::{
    AgentRole, EntryKind, MemoryDraft, RoleStrategy, TaskFrame, TerminalResult,
};

use crate::prompt::{TOOL_ONLY_PROTOCOL, compose};
use crate::search::MEMORY_SEARCH;

const INTRO: &str = "You write sections of a financial research report. Base every claim on \
the findings in the task context or in shared memory, keep the numbers exact and name the \
data source behind each one. Write for an investor: concise, specific, no filler.";

const SECTION_STREAM_PREFIX: &str = "section-";

/// Report writing strategy. Sections are recorded in shared memory so later
/// sections can stay consistent with them; the outline is not.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReportGenerator;

impl ReportGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl RoleStrategy for ReportGenerator {
    fn role(&self) -> AgentRole {
        AgentRole::Generator
    }

    fn system_prompt(&self, capabilities: &str) -> String {
        compose(INTRO, TOOL_ONLY_PROTOCOL, capabilities)
    }

    fn allows_code(&self) -> bool {
        false
    }

    fn allows_capability(&self, name: &str) -> bool {
        name == MEMORY_SEARCH
    }

    fn absorb(&self, frame: &TaskFrame, identity: &str, result: &TerminalResult) -> Option<MemoryDraft> {
        if !frame.stream.starts_with(SECTION_STREAM_PREFIX) {
            return None;
        }
        let TerminalResult::Final { payload, .. } = result else {
            return None;
        };
        let title = quoted(&frame.instruction).unwrap_or(&frame.stream);
        Some(MemoryDraft {
            kind: EntryKind::Section,
            name: title.to_string(),
            description: format!("Report section written for task {}", frame.task_id),
            payload: serde_json::Value::String(payload.clone()),
            source: identity.to_string(),
            task_id: frame.task_id.clone(),
        })
    }
}

/// First double-quoted span of `text`.
fn quoted(text: &str) -> Option<&str> {
    let start = text.find('"')? + 1;
    let len = text.get(start..)?.find('"')?;
    text.get(start..start + len).filter(|title| !title.is_empty())
}
