//! The research pipeline wired as a `graph_flow` graph:
//! collection -> analysis -> report generation.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use graph_flow::{
    Context, ExecutionStatus, FlowRunner, GraphBuilder, InMemorySessionStorage, NextAction, Session,
    SessionStorage, Task, TaskResult,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::agent::{AgentRole, RoleStrategy, TaskFrame};
use crate::capability::{RetryPolicy, truncate};
use crate::config::PipelineConfig;
use crate::events::{TaskOutcome, TraceCollector};
use crate::llm::{ChatMessage, InferenceClient, complete_with_retry};
use crate::logging::{PipelineLogInput, log_pipeline_completion};
use crate::memory::{EntryKind, MemoryEntry, SharedMemory};
use crate::orchestrator::{StageReport, StageRunner, StageTask};
use crate::persist::{path_component, write_atomic};

const DEFAULT_SECTIONS: [&str; 6] = [
    "Executive Summary",
    "Business Overview",
    "Financial Performance",
    "Valuation and Peers",
    "Risks",
    "Outlook",
];

const MAX_OUTLINE_SECTIONS: usize = 10;

/// Strategies for the three pipeline roles.
#[derive(Clone)]
pub struct RoleSet {
    pub collector: Arc<dyn RoleStrategy>,
    pub analyzer: Arc<dyn RoleStrategy>,
    pub generator: Arc<dyn RoleStrategy>,
}

/// What to collect, what to analyse and (optionally) which sections to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchPlan {
    pub topic: String,
    pub collection: Vec<String>,
    pub analysis: Vec<String>,
    /// Fixed report outline; when empty the generator drafts one.
    #[serde(default)]
    pub sections: Vec<String>,
}

#[derive(Deserialize)]
struct DraftedPlan {
    collection: Vec<String>,
    analysis: Vec<String>,
}

impl ResearchPlan {
    pub fn for_topic(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            collection: vec![
                format!("Collect the income statement, balance sheet and cash flow statement for {topic}."),
                format!("Collect recent stock price history and market data for {topic}."),
                format!("Collect recent news and macroeconomic context relevant to {topic}."),
            ],
            analysis: vec![
                format!("Analyse revenue growth and profitability trends for {topic}."),
                format!("Analyse balance sheet strength, leverage and cash generation for {topic}."),
                format!("Analyse valuation against peers and the main risks for {topic}."),
            ],
            sections: Vec::new(),
            topic,
        }
    }

    /// Load a plan from a `.toml` or `.json` file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plan {}", path.display()))?;
        let plan: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&raw).context("invalid TOML plan")?,
            _ => serde_json::from_str(&raw).context("invalid JSON plan")?,
        };
        if plan.collection.is_empty() && plan.analysis.is_empty() {
            return Err(anyhow!("plan {} has no collection or analysis tasks", path.display()));
        }
        Ok(plan)
    }

    /// Ask the model for collection and analysis tasks, falling back to the
    /// defaults when the request fails or the reply is unusable.
    pub async fn draft(client: &dyn InferenceClient, topic: &str, retry: &RetryPolicy) -> Self {
        let messages = [
            ChatMessage::system(
                "You plan financial research. Reply with a JSON object \
                 {\"collection\": [..], \"analysis\": [..]} listing up to 4 data collection tasks \
                 and up to 6 analysis tasks, each a single imperative sentence.",
            ),
            ChatMessage::user(format!("Research topic: {topic}")),
        ];
        match complete_with_retry(client, &messages, retry, 2).await {
            Ok(reply) => Self::parse_draft(topic, &reply).unwrap_or_else(|| {
                warn!("model plan unusable; using default plan");
                Self::for_topic(topic)
            }),
            Err(err) => {
                warn!(error = %err, "plan drafting failed; using default plan");
                Self::for_topic(topic)
            }
        }
    }

    fn parse_draft(topic: &str, reply: &str) -> Option<Self> {
        let start = reply.find('{')?;
        let end = reply.rfind('}')?;
        let drafted: DraftedPlan = serde_json::from_str(reply.get(start..=end)?).ok()?;
        let clean = |items: Vec<String>, cap: usize| -> Vec<String> {
            items
                .into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .take(cap)
                .collect()
        };
        let collection = clean(drafted.collection, 4);
        let analysis = clean(drafted.analysis, 6);
        if collection.is_empty() || analysis.is_empty() {
            return None;
        }
        Some(Self {
            topic: topic.to_string(),
            collection,
            analysis,
            sections: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSection {
    pub title: String,
    pub body: Option<String>,
    /// False when the body is a partial result from an exhausted budget.
    pub complete: bool,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Figure {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub run_id: String,
    pub topic: String,
    pub sections: Vec<ReportSection>,
    #[serde(default)]
    pub figures: Vec<Figure>,
    pub generated_at: DateTime<Utc>,
}

impl ReportDocument {
    pub fn missing_sections(&self) -> Vec<String> {
        self.sections
            .iter()
            .filter(|section| section.body.is_none())
            .map(|section| section.title.clone())
            .collect()
    }

    pub fn to_markdown(&self) -> String {
        let mut out = format!("# {}\n\n", self.topic);
        for section in &self.sections {
            out.push_str(&format!("## {}\n\n", section.title));
            match &section.body {
                Some(body) => {
                    out.push_str(body.trim());
                    out.push_str("\n\n");
                    if !section.complete {
                        out.push_str("_This section is incomplete._\n\n");
                    }
                }
                None => {
                    let reason = section.failure.as_deref().unwrap_or("no result");
                    out.push_str(&format!("_Section not generated: {reason}._\n\n"));
                }
            }
        }
        if !self.figures.is_empty() {
            out.push_str("## Figures\n\n");
            for figure in &self.figures {
                out.push_str(&format!("![{}]({})\n\n", figure.name, figure.path));
            }
        }
        let missing = self.missing_sections();
        if !missing.is_empty() {
            out.push_str("## Missing sections\n\n");
            for title in missing {
                out.push_str(&format!("- {title}\n"));
            }
        }
        out
    }
}

struct PipelineState {
    runner: Arc<StageRunner>,
    roles: RoleSet,
    plan: ResearchPlan,
    run_id: String,
}

impl PipelineState {
    fn memory(&self) -> &SharedMemory {
        &self.runner.services().memory
    }

    fn frames(&self, kind: &str, role: AgentRole, instructions: &[String]) -> Vec<TaskFrame> {
        instructions
            .iter()
            .enumerate()
            .map(|(index, instruction)| {
                TaskFrame::new(format!("{}:{kind}:{index}", self.run_id), role, instruction.clone())
            })
            .collect()
    }
}

fn describe_entry(entry: &MemoryEntry) -> String {
    format!(
        "[{}] {}: {} (sources: {})",
        entry.kind.as_str(),
        entry.name,
        truncate(&entry.description, 200),
        entry.sources.join(", ")
    )
}

fn excerpt_entry(entry: &MemoryEntry) -> String {
    let payload = match &entry.payload {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    format!("{}\n{}", describe_entry(entry), truncate(&payload, 600))
}

async fn memory_context(
    memory: &SharedMemory,
    query: &str,
    top_k: usize,
    render: fn(&MemoryEntry) -> String,
) -> Vec<String> {
    match memory.retrieve_relevant(query, top_k).await {
        Ok(entries) => entries.iter().map(render).collect(),
        Err(err) => {
            warn!(error = %err, "memory retrieval failed; continuing without context");
            Vec::new()
        }
    }
}

/// Outline from a generator reply: a JSON array of titles, or one title per line.
fn parse_outline(payload: &str) -> Vec<String> {
    if let Ok(titles) = serde_json::from_str::<Vec<String>>(payload.trim()) {
        return titles
            .into_iter()
            .map(|title| title.trim().to_string())
            .filter(|title| !title.is_empty())
            .take(MAX_OUTLINE_SECTIONS)
            .collect();
    }
    payload
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(['#', '-', '*', ' '])
                .trim_start_matches(|c: char| c.is_ascii_digit())
                .trim_start_matches(['.', ')', ' '])
                .trim()
                .to_string()
        })
        .filter(|title| !title.is_empty())
        .take(MAX_OUTLINE_SECTIONS)
        .collect()
}

struct CollectionStageTask {
    state: Arc<PipelineState>,
}

#[async_trait]
impl Task for CollectionStageTask {
    fn id(&self) -> &str {
        "collection"
    }

    #[instrument(name = "stage.collection", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let state = &self.state;
        let tasks = state
            .frames("collect", AgentRole::Collector, &state.plan.collection)
            .into_iter()
            .map(|frame| StageTask::new(frame, state.roles.collector.clone()))
            .collect();
        let report = state.runner.run_parallel("collection", tasks).await;
        let summary = format!(
            "Collection finished: {} succeeded, {} failed, {} memory entries",
            report.succeeded(),
            report.failed(),
            state.memory().len()
        );
        context.set("stage.collection", &report).await;
        Ok(TaskResult::new(Some(summary), NextAction::ContinueAndExecute))
    }
}

struct AnalysisStageTask {
    state: Arc<PipelineState>,
}

#[async_trait]
impl Task for AnalysisStageTask {
    fn id(&self) -> &str {
        "analysis"
    }

    #[instrument(name = "stage.analysis", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let state = &self.state;
        let mut tasks = Vec::new();
        for frame in state.frames("analyze", AgentRole::Analyzer, &state.plan.analysis) {
            let datasets = memory_context(state.memory(), &frame.instruction, 8, describe_entry).await;
            tasks.push(StageTask::new(frame.with_context(datasets), state.roles.analyzer.clone()));
        }
        let report = state.runner.run_parallel("analysis", tasks).await;
        let summary = format!(
            "Analysis finished: {} succeeded, {} failed",
            report.succeeded(),
            report.failed()
        );
        context.set("stage.analysis", &report).await;
        Ok(TaskResult::new(Some(summary), NextAction::ContinueAndExecute))
    }
}

struct GenerationStageTask {
    state: Arc<PipelineState>,
}

impl GenerationStageTask {
    fn figures(&self) -> Vec<Figure> {
        self.state
            .memory()
            .by_kind(EntryKind::Chart)
            .into_iter()
            .filter_map(|entry| {
                let path = entry.payload.get("path")?.as_str()?.to_string();
                Some(Figure { name: entry.name, path })
            })
            .collect()
    }
}

#[async_trait]
impl Task for GenerationStageTask {
    fn id(&self) -> &str {
        "generation"
    }

    #[instrument(name = "stage.generation", skip(self, context))]
    async fn run(&self, context: Context) -> graph_flow::Result<TaskResult> {
        let state = &self.state;
        let topic = &state.plan.topic;
        let task_id = format!("{}:report", state.run_id);
        let generator = state.roles.generator.clone();
        let mut stage = state.runner.sequential("generation");

        let titles = if state.plan.sections.is_empty() {
            let findings = memory_context(state.memory(), topic, 12, describe_entry).await;
            let frame = TaskFrame::new(
                task_id.clone(),
                AgentRole::Generator,
                format!(
                    "Draft the outline of a financial research report on: {topic}. Return the \
                     section titles as a JSON array of strings inside <final_result>...</final_result>."
                ),
            )
            .with_stream("outline")
            .with_context(findings);
            let outline = stage.run(StageTask::new(frame, generator.clone())).await;
            let titles = outline.payload().map(parse_outline).unwrap_or_default();
            if titles.is_empty() {
                warn!("outline unavailable; using default sections");
                DEFAULT_SECTIONS.iter().map(|title| title.to_string()).collect()
            } else {
                titles
            }
        } else {
            state.plan.sections.clone()
        };

        let mut sections: Vec<ReportSection> = Vec::with_capacity(titles.len());
        for (index, title) in titles.iter().enumerate() {
            let mut frame_context: Vec<String> = sections
                .iter()
                .filter_map(|section| {
                    let body = section.body.as_deref()?;
                    Some(format!("Already written \"{}\": {}", section.title, truncate(body, 400)))
                })
                .collect();
            frame_context.extend(memory_context(state.memory(), title, 8, excerpt_entry).await);

            let frame = TaskFrame::new(
                task_id.clone(),
                AgentRole::Generator,
                format!(
                    "Write the report section \"{title}\" for the research topic: {topic}. Use \
                     markdown without a top-level heading and cite the data sources you rely on. \
                     Return the section text inside <report>...</report>."
                ),
            )
            .with_stream(format!("section-{index}"))
            .with_context(frame_context);

            let report = stage.run(StageTask::new(frame, generator.clone())).await;
            let failure = (!report.outcome.is_success()).then(|| match &report.outcome {
                TaskOutcome::Failure { reason, .. } => reason.clone(),
                TaskOutcome::Timeout => "stage timed out".to_string(),
                TaskOutcome::Success => String::new(),
            });
            sections.push(ReportSection {
                title: title.clone(),
                body: report.payload().map(str::to_string),
                complete: report.outcome.is_success(),
                failure,
            });
        }
        let stage_report = stage.finish();

        let document = ReportDocument {
            run_id: state.run_id.clone(),
            topic: topic.clone(),
            sections,
            figures: self.figures(),
            generated_at: Utc::now(),
        };
        let summary = format!(
            "Report assembled: {} sections, {} missing",
            document.sections.len(),
            document.missing_sections().len()
        );
        context.set("stage.generation", &stage_report).await;
        context.set("report.document", &document).await;
        Ok(TaskResult::new(Some(summary), NextAction::End))
    }
}

pub struct PipelineOptions {
    pub run_id: String,
    pub plan: ResearchPlan,
}

impl PipelineOptions {
    pub fn new(run_id: impl Into<String>, plan: ResearchPlan) -> Self {
        Self {
            run_id: run_id.into(),
            plan,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub report: ReportDocument,
    pub report_path: PathBuf,
    pub stages: Vec<StageReport>,
    pub trace_path: Option<PathBuf>,
}

fn build_graph(state: Arc<PipelineState>) -> (Arc<graph_flow::Graph>, String) {
    let collection = Arc::new(CollectionStageTask { state: state.clone() });
    let analysis = Arc::new(AnalysisStageTask { state: state.clone() });
    let generation = Arc::new(GenerationStageTask { state });
    let start = collection.id().to_string();

    let graph = GraphBuilder::new("finsight_pipeline")
        .add_task(collection.clone())
        .add_task(analysis.clone())
        .add_task(generation.clone())
        .add_edge(collection.id(), analysis.id())
        .add_edge(analysis.id(), generation.id())
        .set_start_task(collection.id())
        .build();
    (Arc::new(graph), start)
}

/// Run collection, analysis and report generation for one research topic.
///
/// Failed tasks never abort the pipeline; the report lists the sections that
/// could not be produced. The report, the run log record and (when a trace
/// collector is given) the event trace are written under `config`'s
/// directories.
#[instrument(skip_all, fields(run_id = %options.run_id))]
pub async fn run_pipeline(
    runner: Arc<StageRunner>,
    roles: RoleSet,
    config: &PipelineConfig,
    options: PipelineOptions,
    trace: Option<TraceCollector>,
) -> Result<PipelineOutcome> {
    let run_id = options.run_id.clone();
    let topic = options.plan.topic.clone();
    let state = Arc::new(PipelineState {
        runner,
        roles,
        plan: options.plan,
        run_id: run_id.clone(),
    });
    let (graph, start) = build_graph(state.clone());

    let storage = Arc::new(InMemorySessionStorage::new());
    let flow = FlowRunner::new(graph, storage.clone());
    let session = Session::new_from_task(run_id.clone(), &start);
    session.context.set("run_id", run_id.clone()).await;
    session.context.set("topic", topic.clone()).await;
    storage
        .save(session)
        .await
        .map_err(|err| anyhow!("failed to persist session: {err}"))?;

    info!(%topic, "pipeline started");
    loop {
        let result = flow
            .run(&run_id)
            .await
            .map_err(|err| anyhow!("pipeline execution failure: {err}"))?;
        match result.status {
            ExecutionStatus::Completed => break,
            ExecutionStatus::WaitingForInput => continue,
            ExecutionStatus::Error(message) => return Err(anyhow!(message)),
        }
    }

    let session = storage
        .get(&run_id)
        .await
        .map_err(|err| anyhow!("failed to reload session: {err}"))?
        .ok_or_else(|| anyhow!("session missing after execution"))?;
    let report: ReportDocument = session
        .context
        .get("report.document")
        .await
        .ok_or_else(|| anyhow!("pipeline finished without a report"))?;
    let mut stages = Vec::new();
    for key in ["stage.collection", "stage.analysis", "stage.generation"] {
        if let Some(stage) = session.context.get::<StageReport>(key).await {
            stages.push(stage);
        }
    }

    let report_path = config
        .artifact_dir()
        .join(path_component(&run_id))
        .join("report.md");
    write_atomic(&report_path, report.to_markdown().as_bytes())?;

    let mut succeeded_tasks = Vec::new();
    let mut failed_tasks = Vec::new();
    for task in stages.iter().flat_map(|stage| stage.tasks.iter()) {
        let label = format!("{}:{}", task.task_id, task.stream);
        if task.outcome.is_success() {
            succeeded_tasks.push(label);
        } else {
            failed_tasks.push(label);
        }
    }
    let sources: BTreeSet<String> = state
        .memory()
        .all()
        .into_iter()
        .flat_map(|entry| entry.sources)
        .collect();
    let log_input = PipelineLogInput {
        run_id: run_id.clone(),
        topic: topic.clone(),
        succeeded_tasks,
        failed_tasks,
        missing_sections: report.missing_sections(),
        sources: sources.into_iter().collect(),
        report_path: Some(report_path.display().to_string()),
    };
    if let Err(err) = log_pipeline_completion(&config.log_dir(), config.log_retention_days, log_input) {
        warn!(error = %err, "failed to append pipeline log record");
    }

    let trace_path = match trace {
        Some(mut trace) => {
            trace.drain_ready();
            let path = config
                .log_dir()
                .join("traces")
                .join(format!("{}.json", path_component(&run_id)));
            match trace.persist(&path) {
                Ok(()) => Some(path),
                Err(err) => {
                    warn!(error = %err, "failed to persist event trace");
                    None
                }
            }
        }
        None => None,
    };

    info!(
        report = %report_path.display(),
        missing = report.missing_sections().len(),
        "pipeline finished"
    );
    Ok(PipelineOutcome {
        run_id,
        report,
        report_path,
        stages,
        trace_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedInference;

    #[test]
    fn outline_accepts_json_or_lists() {
        assert_eq!(
            parse_outline(r#"["Summary", " Risks ", ""]"#),
            vec!["Summary".to_string(), "Risks".to_string()]
        );
        assert_eq!(
            parse_outline("1. Summary\n- Growth\n## Outlook\n\n"),
            vec!["Summary".to_string(), "Growth".to_string(), "Outlook".to_string()]
        );
    }

    #[tokio::test]
    async fn drafted_plan_falls_back_on_garbage() {
        let client = ScriptedInference::replies(&[
            "Here you go: {\"collection\": [\"Get 10-K\"], \"analysis\": [\"Margins\", \"Debt\"]}",
            "no json here",
        ]);
        let retry = RetryPolicy::immediate(1);

        let plan = ResearchPlan::draft(&client, "ACME Corp", &retry).await;
        assert_eq!(plan.collection, vec!["Get 10-K".to_string()]);
        assert_eq!(plan.analysis.len(), 2);

        let fallback = ResearchPlan::draft(&client, "ACME Corp", &retry).await;
        assert_eq!(fallback, ResearchPlan::for_topic("ACME Corp"));
    }

    #[test]
    fn plan_files_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.toml");
        std::fs::write(
            &path,
            "topic = \"ACME\"\ncollection = [\"Get filings\"]\nanalysis = [\"Margins\"]\nsections = [\"Summary\"]\n",
        )
        .unwrap();
        let plan = ResearchPlan::from_path(&path).unwrap();
        assert_eq!(plan.sections, vec!["Summary".to_string()]);
    }

    #[test]
    fn markdown_lists_missing_sections() {
        let document = ReportDocument {
            run_id: "r1".into(),
            topic: "ACME outlook".into(),
            sections: vec![
                ReportSection {
                    title: "Summary".into(),
                    body: Some("Revenue grew 12%.".into()),
                    complete: true,
                    failure: None,
                },
                ReportSection {
                    title: "Risks".into(),
                    body: None,
                    complete: false,
                    failure: Some("round budget exhausted".into()),
                },
            ],
            figures: vec![Figure {
                name: "Revenue trend".into(),
                path: "artifacts/revenue-trend.png".into(),
            }],
            generated_at: Utc::now(),
        };
        let markdown = document.to_markdown();
        assert!(markdown.starts_with("# ACME outlook"));
        assert!(markdown.contains("Revenue grew 12%."));
        assert!(markdown.contains("_Section not generated: round budget exhausted._"));
        assert!(markdown.contains("![Revenue trend](artifacts/revenue-trend.png)"));
        assert!(markdown.trim_end().ends_with("## Missing sections\n\n- Risks"));
        assert_eq!(document.missing_sections(), vec!["Risks".to_string()]);
    }
}
