use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt};

use crate::FinsightError;
use crate::config::LoggingConfig;

static TELEMETRY_GUARD: OnceLock<()> = OnceLock::new();

/// Options for the global tracing subscriber.
#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    pub env_filter: Option<String>,
    pub with_ansi: bool,
}

impl TelemetryOptions {
    /// `RUST_LOG` still wins over the configured level.
    pub fn from_logging(logging: &LoggingConfig) -> Self {
        Self {
            env_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| Some(logging.level.clone())),
            with_ansi: true,
        }
    }
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            env_filter: None,
            with_ansi: true,
        }
    }
}

/// Initialise the global tracing subscriber.
///
/// Safe to call multiple times; only the first invocation installs the subscriber.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), FinsightError> {
    if TELEMETRY_GUARD.get().is_some() {
        return Ok(());
    }

    let env_filter = options
        .env_filter
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());

    fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_ansi(options.with_ansi)
        .with_target(true)
        .try_init()
        .map_err(|err| FinsightError::InvalidConfiguration(format!("telemetry init failed: {err}")))?;

    TELEMETRY_GUARD.get_or_init(|| ());
    Ok(())
}
