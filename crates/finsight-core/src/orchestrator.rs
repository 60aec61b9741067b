//! Stage execution for agent runs.
//!
//! A stage runs its tasks either concurrently (collection, analysis) or one
//! after another (report sections). A failed task never aborts its siblings;
//! it is recorded in the [`StageReport`] and the stage moves on.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::agent::{AgentRuntime, RoleStrategy, RuntimeServices, RuntimeSettings, TaskFrame, TerminalResult};
use crate::config::PipelineConfig;
use crate::events::TaskOutcome;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum concurrent runs inside one parallel stage.
    pub stage_concurrency: usize,
    /// Wall-clock budget per stage; runs still going are cancelled.
    pub stage_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stage_concurrency: 4,
            stage_timeout: None,
        }
    }
}

impl From<&PipelineConfig> for OrchestratorConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            stage_concurrency: config.stage_concurrency.max(1),
            stage_timeout: config.stage_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// One agent run to schedule.
#[derive(Clone)]
pub struct StageTask {
    pub frame: TaskFrame,
    pub strategy: Arc<dyn RoleStrategy>,
}

impl StageTask {
    pub fn new(frame: TaskFrame, strategy: Arc<dyn RoleStrategy>) -> Self {
        Self { frame, strategy }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: String,
    pub identity: String,
    pub stream: String,
    pub outcome: TaskOutcome,
    pub result: Option<TerminalResult>,
    pub duration_ms: u64,
}

impl TaskReport {
    /// Final payload, or the partial one left by an exhausted budget.
    pub fn payload(&self) -> Option<&str> {
        self.result.as_ref().and_then(TerminalResult::payload)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub tasks: Vec<TaskReport>,
    pub duration_ms: u64,
}

impl StageReport {
    pub fn succeeded(&self) -> usize {
        self.tasks.iter().filter(|task| task.outcome.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.tasks.len() - self.succeeded()
    }

    pub fn failed_task_ids(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|task| !task.outcome.is_success())
            .map(|task| task.task_id.clone())
            .collect()
    }
}

/// Cancels a stage's runs once its wall-clock budget is spent.
struct StageClock {
    token: CancellationToken,
    expired: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

impl StageClock {
    fn start(parent: &CancellationToken, limit: Option<Duration>) -> Self {
        let token = parent.child_token();
        let expired = Arc::new(AtomicBool::new(false));
        let timer = limit.map(|limit| {
            let token = token.clone();
            let expired = expired.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                expired.store(true, Ordering::SeqCst);
                token.cancel();
            })
        });
        Self { token, expired, timer }
    }
}

impl Drop for StageClock {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub struct StageRunner {
    services: RuntimeServices,
    settings: RuntimeSettings,
    config: OrchestratorConfig,
    cancel: CancellationToken,
}

impl StageRunner {
    pub fn new(services: RuntimeServices, settings: RuntimeSettings, config: OrchestratorConfig) -> Self {
        Self {
            services,
            settings,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancel every stage when `token` fires (e.g. on Ctrl-C).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn services(&self) -> &RuntimeServices {
        &self.services
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Run independent tasks concurrently, bounded by `stage_concurrency`.
    /// Reports come back in task order.
    #[instrument(skip(self, tasks), fields(tasks = tasks.len()))]
    pub async fn run_parallel(&self, stage: &str, tasks: Vec<StageTask>) -> StageReport {
        let started = Instant::now();
        self.services.events.stage_started(stage, tasks.len());
        let clock = StageClock::start(&self.cancel, self.config.stage_timeout);
        let permits = Arc::new(Semaphore::new(self.config.stage_concurrency.max(1)));

        let planned: Vec<PlannedTask> = tasks.iter().map(PlannedTask::from).collect();
        let mut set = JoinSet::new();
        for (index, task) in tasks.into_iter().enumerate() {
            let services = self.services.clone();
            let settings = self.settings.clone();
            let token = clock.token.clone();
            let expired = clock.expired.clone();
            let permits = permits.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let report = execute(services, settings, task, token, expired).await;
                (index, report)
            });
        }

        let mut finished = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => finished.push(entry),
                Err(err) => error!(stage, error = %err, "stage task aborted"),
            }
        }

        let report = StageReport {
            stage: stage.to_string(),
            tasks: in_task_order(planned, finished),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.finish_stage(&report);
        report
    }

    /// Open a stage whose tasks run one at a time, so later tasks can be
    /// framed from earlier results.
    pub fn sequential(&self, stage: &str) -> SequentialStage<'_> {
        self.services.events.stage_started(stage, 0);
        SequentialStage {
            runner: self,
            stage: stage.to_string(),
            clock: StageClock::start(&self.cancel, self.config.stage_timeout),
            started: Instant::now(),
            reports: Vec::new(),
        }
    }

    fn finish_stage(&self, report: &StageReport) {
        let (succeeded, failed) = (report.succeeded(), report.failed());
        self.services
            .events
            .stage_finished(&report.stage, succeeded, failed, report.duration_ms);
        if failed > 0 {
            warn!(
                stage = %report.stage,
                succeeded,
                failed,
                failed_tasks = ?report.failed_task_ids(),
                "stage finished with failures"
            );
        } else {
            info!(stage = %report.stage, succeeded, duration_ms = report.duration_ms, "stage finished");
        }
    }
}

pub struct SequentialStage<'a> {
    runner: &'a StageRunner,
    stage: String,
    clock: StageClock,
    started: Instant,
    reports: Vec<TaskReport>,
}

impl SequentialStage<'_> {
    pub async fn run(&mut self, task: StageTask) -> TaskReport {
        let report = execute(
            self.runner.services.clone(),
            self.runner.settings.clone(),
            task,
            self.clock.token.clone(),
            self.clock.expired.clone(),
        )
        .await;
        self.reports.push(report.clone());
        report
    }

    pub fn finish(self) -> StageReport {
        let report = StageReport {
            stage: self.stage.clone(),
            tasks: self.reports.clone(),
            duration_ms: self.started.elapsed().as_millis() as u64,
        };
        self.runner.finish_stage(&report);
        report
    }
}

/// Identity of a scheduled task, kept so a run lost to an aborted worker
/// still shows up in its stage report.
struct PlannedTask {
    task_id: String,
    identity: String,
    stream: String,
}

impl From<&StageTask> for PlannedTask {
    fn from(task: &StageTask) -> Self {
        Self {
            task_id: task.frame.task_id.clone(),
            identity: task.frame.identity(),
            stream: task.frame.stream.clone(),
        }
    }
}

impl PlannedTask {
    fn aborted(self) -> TaskReport {
        TaskReport {
            task_id: self.task_id,
            identity: self.identity,
            stream: self.stream,
            outcome: TaskOutcome::Failure {
                reason: "stage worker aborted".to_string(),
                retryable: true,
            },
            result: None,
            duration_ms: 0,
        }
    }
}

/// One report per planned task, in planning order.
fn in_task_order(planned: Vec<PlannedTask>, finished: Vec<(usize, TaskReport)>) -> Vec<TaskReport> {
    let mut slots: Vec<Option<TaskReport>> = vec![None; planned.len()];
    for (index, report) in finished {
        if let Some(slot) = slots.get_mut(index) {
            *slot = Some(report);
        }
    }
    planned
        .into_iter()
        .zip(slots)
        .map(|(plan, slot)| slot.unwrap_or_else(|| plan.aborted()))
        .collect()
}

async fn execute(
    services: RuntimeServices,
    settings: RuntimeSettings,
    task: StageTask,
    token: CancellationToken,
    expired: Arc<AtomicBool>,
) -> TaskReport {
    let started = Instant::now();
    let task_id = task.frame.task_id.clone();
    let identity = task.frame.identity();
    let stream = task.frame.stream.clone();

    let run = async {
        let mut runtime = AgentRuntime::prepare(task.strategy, services, settings, task.frame).await?;
        runtime.run(&token).await
    };
    let (outcome, result) = match AssertUnwindSafe(run).catch_unwind().await {
        Ok(Ok(result)) => {
            let outcome = match &result {
                TerminalResult::Final { .. } => TaskOutcome::Success,
                TerminalResult::BudgetExhausted { .. } => TaskOutcome::Failure {
                    reason: "round budget exhausted".to_string(),
                    retryable: false,
                },
                TerminalResult::Cancelled { .. } if expired.load(Ordering::SeqCst) => TaskOutcome::Timeout,
                TerminalResult::Cancelled { .. } => TaskOutcome::Failure {
                    reason: "cancelled".to_string(),
                    retryable: true,
                },
            };
            (outcome, Some(result))
        }
        Ok(Err(err)) => {
            error!(task_id = %task_id, kind = err.kind(), error = %err, "agent run failed");
            let outcome = TaskOutcome::Failure {
                reason: err.to_string(),
                retryable: false,
            };
            (outcome, None)
        }
        Err(_) => {
            error!(task_id = %task_id, "agent run panicked");
            let outcome = TaskOutcome::Failure {
                reason: "agent run panicked".to_string(),
                retryable: false,
            };
            (outcome, None)
        }
    };

    TaskReport {
        task_id,
        identity,
        stream,
        outcome,
        result,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRole;
    use crate::capability::{CapabilityRegistry, RetryPolicy};
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::events::EventCollector;
    use crate::memory::{HashingEmbedder, SharedMemory};
    use crate::test_support::ScriptedInference;

    struct Echo;

    impl RoleStrategy for Echo {
        fn role(&self) -> AgentRole {
            AgentRole::Collector
        }

        fn system_prompt(&self, _capabilities: &str) -> String {
            "collect".to_string()
        }
    }

    fn runner(replies: &[&str], config: OrchestratorConfig) -> StageRunner {
        let (events, _receiver) = EventCollector::new();
        let services = RuntimeServices {
            inference: Arc::new(ScriptedInference::replies(replies)),
            capabilities: Arc::new(CapabilityRegistry::default()),
            sandbox: None,
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            memory: Arc::new(SharedMemory::in_memory(Arc::new(HashingEmbedder::default()))),
            events,
            namespace_root: std::env::temp_dir().join("finsight-orchestrator-tests"),
        };
        let settings = RuntimeSettings {
            max_rounds: 3,
            resume: false,
            retry: RetryPolicy::immediate(1),
        };
        StageRunner::new(services, settings, config)
    }

    fn task(id: &str) -> StageTask {
        StageTask::new(TaskFrame::new(id, AgentRole::Collector, "collect"), Arc::new(Echo))
    }

    #[tokio::test]
    async fn failed_task_does_not_block_siblings() {
        // Two good replies; whichever task runs last finds the script dry.
        let runner = runner(
            &["<final_result>a</final_result>", "<final_result>b</final_result>"],
            OrchestratorConfig {
                stage_concurrency: 1,
                stage_timeout: None,
            },
        );
        let report = runner
            .run_parallel("collection", vec![task("t1"), task("t2"), task("t3")])
            .await;

        assert_eq!(report.tasks.len(), 3);
        let ids: Vec<&str> = report.tasks.iter().map(|task| task.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        let failed = report
            .tasks
            .iter()
            .find(|task| !task.outcome.is_success())
            .unwrap();
        assert!(matches!(
            failed.result,
            Some(TerminalResult::BudgetExhausted { partial: None, rounds: 3 })
        ));
    }

    #[tokio::test]
    async fn cancelled_stage_reports_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let runner = runner(&["<final_result>a</final_result>"], OrchestratorConfig::default())
            .with_cancellation(token);
        let report = runner.run_parallel("analysis", vec![task("t1")]).await;
        assert!(matches!(
            report.tasks[0].result,
            Some(TerminalResult::Cancelled { rounds: 0 })
        ));
        assert!(!report.tasks[0].outcome.is_success());
    }

    #[tokio::test]
    async fn sequential_stage_collects_reports_in_order() {
        let runner = runner(
            &["<final_result>intro</final_result>", "<final_result>body</final_result>"],
            OrchestratorConfig::default(),
        );
        let mut stage = runner.sequential("generation");
        let first = stage.run(task("s0")).await;
        assert_eq!(first.payload(), Some("intro"));
        stage.run(task("s1")).await;
        let report = stage.finish();
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.tasks[1].payload(), Some("body"));
    }

    #[test]
    fn aborted_workers_are_reported_as_failures() {
        let planned: Vec<PlannedTask> = [task("t1"), task("t2"), task("t3")]
            .iter()
            .map(PlannedTask::from)
            .collect();
        let done = TaskReport {
            outcome: TaskOutcome::Success,
            ..PlannedTask::from(&task("t3")).aborted()
        };

        let reports = in_task_order(planned, vec![(2, done)]);

        let ids: Vec<&str> = reports.iter().map(|report| report.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3"]);
        assert!(reports[2].outcome.is_success());
        assert!(matches!(
            &reports[0].outcome,
            TaskOutcome::Failure { reason, retryable: true } if reason == "stage worker aborted"
        ));
        assert_eq!(reports[1].identity, TaskFrame::new("t2", AgentRole::Collector, "collect").identity());
    }
}
