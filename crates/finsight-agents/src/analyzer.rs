//! Analyzer role: turns collected datasets into findings and charts.

use finsight_core::{AgentRole, RoleStrategy};

use crate::prompt::{ACTION_PROTOCOL, compose};

const INTRO: &str = "You are a financial analyst. The datasets already collected are listed \
in the task context; search shared memory for their contents and compute with Python where \
numbers are involved. Use draw_chart when a trend is clearer as a figure. Finish with a \
<final_result> stating your conclusions with the figures that support them and the sources \
they came from.";

#[derive(Debug, Default, Clone, Copy)]
pub struct AnalyzerAgent;

impl AnalyzerAgent {
    pub fn new() -> Self {
        Self
    }
}

impl RoleStrategy for AnalyzerAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Analyzer
    }

    fn system_prompt(&self, capabilities: &str) -> String {
        compose(INTRO, ACTION_PROTOCOL, capabilities)
    }
}
