//! Draft/evaluate loop that turns plotting code into an accepted chart.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::action::{Action, parse_action};
use crate::capability::{RetryPolicy, truncate};
use crate::llm::{ChatMessage, InferenceClient, complete_with_retry};
use crate::metrics::record_refinement;
use crate::persist::{path_component, sha256_hex, write_atomic};
use crate::sandbox::{CodeSandbox, Namespace, SandboxOutputSpec};

/// File the plotting snippet must write inside the sandbox workspace.
pub const CHART_FILE: &str = "chart.png";

const CHART_SYSTEM_PROMPT: &str = "You write Python plotting code with matplotlib. \
Variables from earlier analysis are already defined. Save the figure to 'chart.png' \
(dpi 150, tight bbox) and do not call plt.show(). Reply with the code inside \
<execute>...</execute>.";

const DEFAULT_RUBRIC: &str = "Review this financial chart. Check that the title, axis labels and \
units are present, the legend is readable, nothing overlaps and the chart type suits the data. \
Reply FINISH if it is ready for a report, otherwise REVISE followed by concrete fixes.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum CritiqueVerdict {
    Finish,
    Revise { feedback: String },
}

static VERDICT_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(finish|revise)\b").expect("invalid verdict regex"));

impl CritiqueVerdict {
    /// Read a free-text review. The first standalone FINISH or REVISE
    /// decides; a reply with neither is treated as a revision request.
    pub fn parse(text: &str) -> Self {
        let Some(token) = VERDICT_TOKEN.find(text) else {
            return CritiqueVerdict::Revise {
                feedback: text.trim().to_string(),
            };
        };
        if token.as_str().eq_ignore_ascii_case("finish") {
            return CritiqueVerdict::Finish;
        }
        let feedback = text[token.end()..]
            .trim_start_matches([':', '-', ' ', '\n'])
            .trim();
        CritiqueVerdict::Revise {
            feedback: feedback.to_string(),
        }
    }
}

#[async_trait]
pub trait VisionEvaluator: Send + Sync {
    async fn evaluate(&self, image_png: &[u8], rubric: &str) -> Result<CritiqueVerdict>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementOutcome {
    /// The evaluator returned FINISH.
    Accepted,
    /// Iteration cap reached; the last successful draft is returned.
    CapReached,
    /// No evaluator (or it failed); the first successful draft is returned.
    Unreviewed,
    /// A later drafting or sandbox call failed; the last successful draft is returned.
    Interrupted,
    NoArtifact,
}

impl RefinementOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefinementOutcome::Accepted => "accepted",
            RefinementOutcome::CapReached => "cap_reached",
            RefinementOutcome::Unreviewed => "unreviewed",
            RefinementOutcome::Interrupted => "interrupted",
            RefinementOutcome::NoArtifact => "no_artifact",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartArtifact {
    pub path: PathBuf,
    pub digest: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementReport {
    pub outcome: RefinementOutcome,
    pub iterations: u32,
    pub artifact: Option<ChartArtifact>,
    pub feedback: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ChartRequest {
    pub name: String,
    pub instruction: String,
    pub rubric: Option<String>,
}

impl ChartRequest {
    pub fn new(name: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instruction: instruction.into(),
            rubric: None,
        }
    }
}

struct Draft {
    code: String,
    png: Vec<u8>,
}

pub struct ChartRefiner {
    inference: Arc<dyn InferenceClient>,
    sandbox: CodeSandbox,
    vision: Option<Arc<dyn VisionEvaluator>>,
    retry: RetryPolicy,
    max_iterations: u32,
    artifact_dir: PathBuf,
}

impl ChartRefiner {
    pub fn new(
        inference: Arc<dyn InferenceClient>,
        sandbox: CodeSandbox,
        artifact_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inference,
            sandbox,
            vision: None,
            retry: RetryPolicy::default(),
            max_iterations: 3,
            artifact_dir: artifact_dir.into(),
        }
    }

    pub fn with_vision(mut self, vision: Arc<dyn VisionEvaluator>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Draft, execute and critique until the chart is accepted or the
    /// iteration cap is hit. Failed executions count as iterations.
    ///
    /// Only bytes from a successful execution are ever written out, and only
    /// once the loop has terminated.
    #[instrument(skip(self, namespace, request), fields(chart = %request.name, run_id = %namespace.run_id()))]
    pub async fn refine(&self, namespace: &mut Namespace, request: &ChartRequest) -> Result<RefinementReport> {
        let rubric = request.rubric.as_deref().unwrap_or(DEFAULT_RUBRIC);
        let mut messages = vec![
            ChatMessage::system(CHART_SYSTEM_PROMPT),
            ChatMessage::user(request.instruction.clone()),
        ];
        let mut feedback_log = Vec::new();
        let mut last_good: Option<Draft> = None;
        let mut iterations = 0;
        let mut outcome = None;

        while iterations < self.max_iterations {
            iterations += 1;
            let reply = match complete_with_retry(self.inference.as_ref(), &messages, &self.retry, 2)
                .await
                .context("chart drafting request failed")
            {
                Ok(reply) => reply,
                Err(err) if last_good.is_some() => {
                    warn!(iteration = iterations, error = %err, "chart drafting failed; keeping the last good draft");
                    outcome = Some(RefinementOutcome::Interrupted);
                    break;
                }
                Err(err) => return Err(err),
            };
            messages.push(ChatMessage::assistant(reply.clone()));

            let code = match parse_action(&reply) {
                Action::CodeExec { code } => code,
                other => {
                    let feedback = format!(
                        "Expected plotting code inside <execute>...</execute>, got a {} response.",
                        other.label()
                    );
                    record_refinement("no_code");
                    self.push_feedback(&mut messages, &mut feedback_log, feedback);
                    continue;
                }
            };

            let report = match self
                .sandbox
                .run(namespace, &code, &[SandboxOutputSpec::binary(CHART_FILE)])
                .await
                .context("chart sandbox unavailable")
            {
                Ok(report) => report,
                Err(err) if last_good.is_some() => {
                    warn!(iteration = iterations, error = %err, "chart sandbox failed; keeping the last good draft");
                    outcome = Some(RefinementOutcome::Interrupted);
                    break;
                }
                Err(err) => return Err(err),
            };

            if !report.success {
                let error = report.error.as_deref().unwrap_or("unknown error");
                debug!(iteration = iterations, "chart code failed to execute");
                record_refinement("execution_error");
                let feedback = format!("The code failed:\n{}\nFix this error.", truncate(error, 1_500));
                self.push_feedback(&mut messages, &mut feedback_log, feedback);
                continue;
            }
            let Some(png) = report
                .artifact(CHART_FILE)
                .map(|output| output.bytes.clone())
                .filter(|bytes| !bytes.is_empty())
            else {
                record_refinement("missing_artifact");
                let feedback = format!("The code ran but did not save '{CHART_FILE}'. Save the figure to that file.");
                self.push_feedback(&mut messages, &mut feedback_log, feedback);
                continue;
            };

            let Some(vision) = &self.vision else {
                last_good = Some(Draft { code, png });
                outcome = Some(RefinementOutcome::Unreviewed);
                break;
            };
            let verdict = vision.evaluate(&png, rubric).await;
            last_good = Some(Draft { code, png });
            match verdict {
                Ok(CritiqueVerdict::Finish) => {
                    outcome = Some(RefinementOutcome::Accepted);
                    break;
                }
                Ok(CritiqueVerdict::Revise { feedback }) => {
                    record_refinement("revise");
                    self.push_feedback(&mut messages, &mut feedback_log, format!("Reviewer feedback:\n{feedback}"));
                }
                Err(err) => {
                    warn!(error = %err, "chart evaluation failed; keeping draft unreviewed");
                    outcome = Some(RefinementOutcome::Unreviewed);
                    break;
                }
            }
        }

        let outcome = match (outcome, &last_good) {
            (Some(outcome), _) => outcome,
            (None, Some(_)) => RefinementOutcome::CapReached,
            (None, None) => RefinementOutcome::NoArtifact,
        };
        record_refinement(outcome.as_str());

        let artifact = match last_good {
            Some(draft) => Some(self.save(&request.name, draft)?),
            None => None,
        };
        info!(outcome = outcome.as_str(), iterations, "chart refinement finished");
        Ok(RefinementReport {
            outcome,
            iterations,
            artifact,
            feedback: feedback_log,
        })
    }

    fn push_feedback(&self, messages: &mut Vec<ChatMessage>, log: &mut Vec<String>, feedback: String) {
        messages.push(ChatMessage::user(feedback.clone()));
        log.push(feedback);
    }

    /// Files are keyed by content digest, so charts sharing a name never
    /// overwrite each other. The code lands before the image it produced.
    fn save(&self, name: &str, draft: Draft) -> Result<ChartArtifact> {
        let digest = sha256_hex(&draft.png);
        let stem = format!("{}-{}", path_component(name), &digest[..12]);
        let path = self.artifact_dir.join(format!("{stem}.png"));
        write_atomic(&path.with_extension("py"), draft.code.as_bytes())?;
        write_atomic(&path, &draft.png)?;
        Ok(ChartArtifact {
            digest,
            path,
            code: draft.code,
        })
    }
}
