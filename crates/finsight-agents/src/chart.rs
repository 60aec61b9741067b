//! `draw_chart`: wraps the chart refinement sub-loop as a capability.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use finsight_core::{
    Capability, CapabilityError, ChartRefiner, ChartRequest, EntryKind, InvocationContext,
    Namespace, ParamSpec, ParamType, RefinementOutcome, ToolOutput, sha256_hex,
};
use serde_json::{Map, Value, json};
use tracing::{info, instrument};

pub const DRAW_CHART: &str = "draw_chart";

const CHART_SOURCE: &str = "chart_refiner";

/// Draws a chart from the caller's namespace.
///
/// The refinement loop runs in a fork of the calling run's namespace, so it
/// sees the caller's variables but its own scratch state never flows back.
pub struct ChartCapability {
    refiner: Arc<ChartRefiner>,
    namespace_root: PathBuf,
}

impl ChartCapability {
    pub fn new(refiner: Arc<ChartRefiner>, namespace_root: impl Into<PathBuf>) -> Self {
        Self {
            refiner,
            namespace_root: namespace_root.into(),
        }
    }

    fn scratch_namespace(&self, ctx: &InvocationContext<'_>, name: &str) -> anyhow::Result<Namespace> {
        let tag = sha256_hex(name.as_bytes());
        let run_id = format!("{}-chart-{}", ctx.run_id, &tag[..8]);
        match ctx.namespace {
            Some(parent) => parent.fork(&run_id),
            None => Namespace::create(&self.namespace_root, &run_id),
        }
    }
}

#[async_trait]
impl Capability for ChartCapability {
    fn name(&self) -> &str {
        DRAW_CHART
    }

    fn description(&self) -> &str {
        "Draw a chart with matplotlib from variables in your namespace; the figure is \
         reviewed and revised before it is saved"
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::required("name", ParamType::String).describe("short title of the chart"),
            ParamSpec::required("instruction", ParamType::String)
                .describe("what to plot and from which variables"),
            ParamSpec::optional("rubric", ParamType::String)
                .describe("what the reviewer should check"),
        ]
    }

    fn category(&self) -> &str {
        "visualization"
    }

    #[instrument(skip(self, args, ctx), fields(run_id = %ctx.run_id))]
    async fn invoke(
        &self,
        args: &Map<String, Value>,
        ctx: &InvocationContext<'_>,
    ) -> Result<Vec<ToolOutput>, CapabilityError> {
        let text = |key: &str| {
            args.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };
        let name = text("name")
            .ok_or_else(|| CapabilityError::InvalidInput("name must not be empty".into()))?;
        let instruction = text("instruction")
            .ok_or_else(|| CapabilityError::InvalidInput("instruction must not be empty".into()))?;
        let mut request = ChartRequest::new(name, instruction);
        request.rubric = text("rubric").map(str::to_string);

        let mut namespace = self.scratch_namespace(ctx, name)?;
        let report = self.refiner.refine(&mut namespace, &request).await?;
        let Some(artifact) = report.artifact else {
            let last = report
                .feedback
                .last()
                .map(String::as_str)
                .unwrap_or("no feedback recorded");
            return Err(CapabilityError::Failed(format!(
                "no chart was produced after {} iteration(s); last feedback: {last}",
                report.iterations
            )));
        };

        info!(
            chart = name,
            outcome = report.outcome.as_str(),
            iterations = report.iterations,
            "chart saved"
        );
        let review = match report.outcome {
            RefinementOutcome::Accepted => "accepted by the reviewer",
            RefinementOutcome::CapReached => "best draft after the revision limit",
            RefinementOutcome::Unreviewed => "not reviewed",
            RefinementOutcome::Interrupted => "last good draft before a failed revision",
            RefinementOutcome::NoArtifact => "no artifact",
        };
        let output = ToolOutput::new(
            name,
            format!("Chart: {instruction} ({review})"),
            json!({
                "path": artifact.path.display().to_string(),
                "digest": artifact.digest,
                "outcome": report.outcome.as_str(),
                "iterations": report.iterations,
            }),
            CHART_SOURCE,
        )
        .with_kind(EntryKind::Chart);
        Ok(vec![output])
    }
}
