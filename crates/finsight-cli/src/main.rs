use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use finsight_agents::{BuiltinCapabilities, ChartCapability, default_roles, register_builtin};
use finsight_core::{
    CapabilityRegistry, ChartRefiner, CheckpointStore, CodeSandbox, Config, ConfigLoader,
    DockerSandboxConfig, DockerSandboxRunner, Embedder, EventCollector, FsCheckpointStore,
    HashingEmbedder, InferenceClient, MemoryLog, OpenAiClient, OpenAiEmbedder, OpenAiVision,
    OrchestratorConfig, PipelineOptions, RateLimiter, ResearchPlan, RetryPolicy, RuntimeServices,
    RuntimeSettings, SharedMemory, StageRunner, StreamKey, TelemetryOptions, TraceCollector,
    init_metrics_from_env, init_telemetry, run_pipeline,
};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const PLAN_FILE: &str = "plan.json";

#[derive(Parser, Debug)]
#[command(name = "finsight", version, about = "Multi-agent financial research")]
struct Cli {
    /// Configuration file (defaults to $FINSIGHT_CONFIG, then ./finsight.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a research task from scratch.
    Run(RunArgs),
    /// Resume a research task from its checkpoints.
    Resume(ResumeArgs),
    /// List checkpoint streams and their latest state.
    Inspect(InspectArgs),
    /// List or search the shared memory of a run.
    Memory(MemoryArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Research topic, e.g. "Outlook for ACME Corp (ACME) over the next 12 months".
    topic: String,

    /// Plan file (.toml or .json); drafted by the model when omitted.
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Run identifier (a fresh UUID by default).
    #[arg(long)]
    run_id: Option<String>,

    #[command(flatten)]
    sources: SourceArgs,
}

#[derive(Args, Debug)]
struct ResumeArgs {
    /// Run to resume.
    run_id: String,

    #[command(flatten)]
    sources: SourceArgs,
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Directory of JSON datasets exposed through `load_dataset`.
    #[arg(long)]
    datasets: Option<PathBuf>,

    /// Run without the Docker sandbox (no code execution, no charts).
    #[arg(long, default_value_t = false)]
    no_sandbox: bool,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// Only show streams of this identity.
    #[arg(long)]
    identity: Option<String>,
}

#[derive(Args, Debug)]
struct MemoryArgs {
    /// Run whose memory to open.
    run_id: String,

    /// Rank entries against this query instead of listing them all.
    #[arg(long)]
    query: Option<String>,

    #[arg(long, default_value_t = 5)]
    top_k: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::load(cli.config.clone())?;
    init_telemetry(TelemetryOptions::from_logging(&config.logging))?;
    init_metrics_from_env("finsight");

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(&config, args).await,
            Command::Resume(args) => resume_command(&config, args).await,
            Command::Inspect(args) => inspect_command(&config, args).await,
            Command::Memory(args) => memory_command(&config, args).await,
        }
    })
}

async fn run_command(config: &Config, args: RunArgs) -> Result<()> {
    let run_id = args.run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let inference: Arc<dyn InferenceClient> = Arc::new(OpenAiClient::from_config(&config.llm)?);
    let retry = RetryPolicy::from(&config.retry);

    let plan = match &args.plan {
        Some(path) => ResearchPlan::from_path(path)?,
        None => ResearchPlan::draft(inference.as_ref(), &args.topic, &retry).await,
    };
    let plan = ResearchPlan {
        topic: args.topic,
        ..plan
    };
    save_plan(config, &run_id, &plan)?;
    info!(%run_id, topic = %plan.topic, "starting research run");

    execute(config, inference, &run_id, plan, config.runtime.resume, &args.sources).await
}

async fn resume_command(config: &Config, args: ResumeArgs) -> Result<()> {
    let plan = load_plan(config, &args.run_id)?;
    let inference: Arc<dyn InferenceClient> = Arc::new(OpenAiClient::from_config(&config.llm)?);
    info!(run_id = %args.run_id, topic = %plan.topic, "resuming research run");
    execute(config, inference, &args.run_id, plan, true, &args.sources).await
}

async fn execute(
    config: &Config,
    inference: Arc<dyn InferenceClient>,
    run_id: &str,
    plan: ResearchPlan,
    resume: bool,
    sources: &SourceArgs,
) -> Result<()> {
    let pipeline = &config.pipeline;
    let retry = RetryPolicy::from(&config.retry);
    let memory = Arc::new(open_memory(config, run_id).await?);

    let sandbox = if sources.no_sandbox {
        None
    } else {
        build_sandbox(config, run_id)
    };
    let chart = match &sandbox {
        Some(sandbox) => {
            let mut refiner = ChartRefiner::new(
                inference.clone(),
                sandbox.clone(),
                pipeline.artifact_dir().join(run_id).join("charts"),
            )
            .with_retry(retry.clone())
            .with_max_iterations(config.refinement.max_iterations);
            match OpenAiVision::from_config(config.vision_or_llm()) {
                Ok(vision) => refiner = refiner.with_vision(Arc::new(vision)),
                Err(err) => warn!(error = %err, "vision model unavailable; charts will not be reviewed"),
            }
            Some(ChartCapability::new(Arc::new(refiner), pipeline.namespace_dir()))
        }
        None => None,
    };

    let mut registry = CapabilityRegistry::new(retry.clone())
        .with_rate_limiter(Arc::new(RateLimiter::from_seconds(&config.rate_limits)));
    register_builtin(
        &mut registry,
        BuiltinCapabilities {
            memory: memory.clone(),
            chart,
            dataset_dir: sources.datasets.clone(),
        },
    )?;
    for (category, names) in registry.categories() {
        info!(%category, capabilities = ?names, "capabilities registered");
    }

    let (events, receiver) = EventCollector::new();
    let services = RuntimeServices {
        inference,
        capabilities: Arc::new(registry),
        sandbox,
        checkpoints: Arc::new(FsCheckpointStore::new(pipeline.checkpoint_dir())),
        memory,
        events,
        namespace_root: pipeline.namespace_dir(),
    };
    let settings = RuntimeSettings {
        max_rounds: config.runtime.max_rounds,
        resume,
        retry,
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling running agents");
            signal.cancel();
        }
    });

    let runner = StageRunner::new(services, settings, OrchestratorConfig::from(pipeline))
        .with_cancellation(shutdown.clone());
    let outcome = run_pipeline(
        Arc::new(runner),
        default_roles(),
        pipeline,
        PipelineOptions::new(run_id, plan),
        Some(TraceCollector::new(receiver)),
    )
    .await?;

    println!("Report: {}", outcome.report_path.display());
    for stage in &outcome.stages {
        println!(
            "  {:<11} {} succeeded, {} failed ({} ms)",
            stage.stage,
            stage.succeeded(),
            stage.failed(),
            stage.duration_ms
        );
    }
    let missing = outcome.report.missing_sections();
    if !missing.is_empty() {
        println!("Missing sections: {}", missing.join(", "));
    }
    if shutdown.is_cancelled() {
        println!("Interrupted. Continue with: finsight resume {run_id}");
    }
    Ok(())
}

fn build_sandbox(config: &Config, run_id: &str) -> Option<CodeSandbox> {
    let workspace = config.pipeline.working_dir.join("sandbox").join(run_id);
    match DockerSandboxRunner::new(DockerSandboxConfig::from_settings(&config.sandbox, workspace)) {
        Ok(runner) => Some(CodeSandbox::new(
            Arc::new(runner),
            Duration::from_secs(config.sandbox.timeout_secs),
        )),
        Err(err) => {
            warn!(error = %err, "sandbox unavailable; code execution and charts disabled");
            None
        }
    }
}

async fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    if let Some(embedding) = &config.embedding {
        return Ok(Arc::new(OpenAiEmbedder::from_config(embedding)?));
    }
    #[cfg(feature = "fastembed-embedder")]
    {
        let embedder = finsight_core::FastEmbedder::new().await?;
        return Ok(Arc::new(embedder));
    }
    #[cfg(not(feature = "fastembed-embedder"))]
    Ok(Arc::new(HashingEmbedder::default()))
}

async fn open_memory(config: &Config, run_id: &str) -> Result<SharedMemory> {
    let log = MemoryLog::open(config.pipeline.memory_dir().join(run_id))?;
    SharedMemory::open(log, build_embedder(config).await?)
}

fn plan_path(config: &Config, run_id: &str) -> PathBuf {
    config.pipeline.working_dir.join("runs").join(run_id).join(PLAN_FILE)
}

fn save_plan(config: &Config, run_id: &str, plan: &ResearchPlan) -> Result<()> {
    let path = plan_path(config, run_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(plan)?;
    std::fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))
}

fn load_plan(config: &Config, run_id: &str) -> Result<ResearchPlan> {
    let path = plan_path(config, run_id);
    if !path.exists() {
        bail!("no run '{run_id}' found under {}", config.pipeline.working_dir.display());
    }
    ResearchPlan::from_path(&path)
}

async fn inspect_command(config: &Config, args: InspectArgs) -> Result<()> {
    let store = FsCheckpointStore::new(config.pipeline.checkpoint_dir());
    let identities = match args.identity {
        Some(identity) => vec![identity],
        None => store.identities()?,
    };
    if identities.is_empty() {
        println!("No checkpoints under {}", store.root().display());
        return Ok(());
    }
    for identity in identities {
        println!("{identity}");
        for stream in store.streams(&identity).await? {
            let key = StreamKey::new(identity.clone(), stream.clone());
            let Some(checkpoint) = store.load_latest(&key).await? else {
                continue;
            };
            let result = checkpoint
                .result
                .as_ref()
                .map(|result| result.label())
                .unwrap_or("in progress");
            println!(
                "  {stream:<12} v{} round {:<3} {:?} ({result}) {}",
                checkpoint.version,
                checkpoint.round,
                checkpoint.status,
                checkpoint.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

async fn memory_command(config: &Config, args: MemoryArgs) -> Result<()> {
    let dir = config.pipeline.memory_dir().join(&args.run_id);
    ensure_dir(&dir, &args.run_id)?;
    let memory = open_memory(config, &args.run_id).await?;
    let entries = match &args.query {
        Some(query) => memory.retrieve_relevant(query, args.top_k).await?,
        None => memory.all(),
    };
    for entry in entries {
        println!(
            "[{}] {} ({}) sources: {}",
            entry.kind.as_str(),
            entry.name,
            &entry.fingerprint[..12.min(entry.fingerprint.len())],
            entry.sources.join(", ")
        );
        if !entry.description.is_empty() {
            println!("    {}", entry.description);
        }
    }
    Ok(())
}

fn ensure_dir(dir: &Path, run_id: &str) -> Result<()> {
    if !dir.is_dir() {
        bail!("run '{run_id}' has no shared memory at {}", dir.display());
    }
    Ok(())
}
