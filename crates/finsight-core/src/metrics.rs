use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};
use tracing::info;

struct FinsightMetrics {
    rounds: Counter<u64>,
    invocations: Counter<u64>,
    invocation_ms: Histogram<f64>,
    sandbox_runs: Counter<u64>,
    sandbox_ms: Histogram<f64>,
    sandbox_alerts: Counter<u64>,
    refinement_iterations: Counter<u64>,
}

static METRICS: OnceCell<FinsightMetrics> = OnceCell::new();

fn handles() -> &'static FinsightMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("finsight");
        FinsightMetrics {
            rounds: meter
                .u64_counter("agent_rounds_total")
                .with_description("Completed agent rounds by role and action")
                .init(),
            invocations: meter
                .u64_counter("capability_invocations_total")
                .with_description("Capability invocations by status")
                .init(),
            invocation_ms: meter
                .f64_histogram("capability_invocation_ms")
                .with_description("Capability invocation latency in milliseconds")
                .init(),
            sandbox_runs: meter
                .u64_counter("sandbox_runs_total")
                .with_description("Total sandbox executions by status")
                .init(),
            sandbox_ms: meter
                .f64_histogram("sandbox_duration_ms")
                .with_description("Sandbox runtime in milliseconds")
                .init(),
            sandbox_alerts: meter
                .u64_counter("sandbox_alerts_total")
                .with_description("Sandbox executions past the failure streak threshold")
                .init(),
            refinement_iterations: meter
                .u64_counter("refinement_iterations_total")
                .with_description("Chart refinement iterations by outcome")
                .init(),
        }
    })
}

/// Hint to operators that OTEL metrics export can be configured externally.
pub fn init_metrics_from_env(service_name: &str) {
    if std::env::var("FINSIGHT_OTEL_METRICS_ENDPOINT").is_ok() {
        info!(
            target = "telemetry",
            "FINSIGHT_OTEL_METRICS_ENDPOINT detected for {service_name}. Install an OTLP meter provider in your deployment to export runtime metrics."
        );
    }
}

pub fn record_round(role: &str, action: &str) {
    handles().rounds.add(
        1,
        &[
            KeyValue::new("role", role.to_string()),
            KeyValue::new("action", action.to_string()),
        ],
    );
}

pub fn record_invocation(capability: &str, status: &str, duration_ms: u64) {
    let metrics = handles();
    let attrs = [
        KeyValue::new("capability", capability.to_string()),
        KeyValue::new("status", status.to_string()),
    ];
    metrics.invocations.add(1, &attrs);
    metrics.invocation_ms.record(duration_ms as f64, &attrs);
}

/// Record OTEL metrics for a sandbox execution (no-op if no provider installed).
pub fn record_sandbox(status: &str, duration_ms: u64, outputs: usize, failure_streak: u64) {
    let metrics = handles();
    let attrs = [
        KeyValue::new("status", status.to_string()),
        KeyValue::new("outputs", outputs as i64),
    ];

    metrics.sandbox_runs.add(1, &attrs);
    metrics.sandbox_ms.record(duration_ms as f64, &attrs);

    if failure_streak >= 3 {
        metrics.sandbox_alerts.add(1, &attrs);
    }
}

pub fn record_refinement(outcome: &str) {
    handles()
        .refinement_iterations
        .add(1, &[KeyValue::new("outcome", outcome.to_string())]);
}
