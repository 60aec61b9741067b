//! Collector role: gathers raw financial data through the data tools.

use finsight_core::{AgentRole, RoleStrategy};

use crate::chart::DRAW_CHART;
use crate::prompt::{ACTION_PROTOCOL, compose};

const INTRO: &str = "You are a financial data collector. Use the tools to fetch the \
statements, prices and news the task asks for. Every tool result is stored in shared memory \
for the analysts, so prefer complete, well-labelled datasets over summaries. When the data is \
collected, reply with a <final_result> that lists what you gathered and where it came from.";

/// Data collection strategy; charts are left to the analysts.
#[derive(Debug, Default, Clone, Copy)]
pub struct CollectorAgent;

impl CollectorAgent {
    pub fn new() -> Self {
        Self
    }
}

impl RoleStrategy for CollectorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Collector
    }

    fn system_prompt(&self, capabilities: &str) -> String {
        compose(INTRO, ACTION_PROTOCOL, capabilities)
    }

    fn allows_capability(&self, name: &str) -> bool {
        name != DRAW_CHART
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finsight_core::{TaskFrame, TerminalResult};

    #[test]
    fn collector_cannot_draw_charts() {
        let agent = CollectorAgent::new();
        assert!(agent.allows_code());
        assert!(agent.allows_capability("fetch_statement"));
        assert!(!agent.allows_capability(DRAW_CHART));
    }

    #[test]
    fn final_results_become_findings() {
        let agent = CollectorAgent::new();
        let frame = TaskFrame::new("run-1:collect:0", AgentRole::Collector, "Collect ACME filings");
        let result = TerminalResult::Final {
            payload: "Income statement 2020-2024 from EDGAR".into(),
            rounds: 3,
        };
        let draft = agent
            .absorb(&frame, &frame.identity(), &result)
            .expect("final results are recorded");
        assert_eq!(draft.name, "Collect ACME filings");
        assert_eq!(draft.task_id, "run-1:collect:0");
        assert!(draft.source.starts_with("collector-"));
    }
}
