use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::capability::RetryPolicy;
use crate::{FinsightError, SecretValue, require_env};

const DEFAULT_CONFIG_PATH: &str = "finsight.toml";
const CONFIG_PATH_ENV: &str = "FINSIGHT_CONFIG";

/// Top-level configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub llm: LlmConfig,
    #[serde(default)]
    pub vision: Option<LlmConfig>,
    #[serde(default)]
    pub embedding: Option<EmbeddingConfig>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub refinement: RefinementConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Minimum seconds between calls, keyed by service name.
    #[serde(default)]
    pub rate_limits: HashMap<String, f64>,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve the configured LLM secret value (from environment only).
    pub fn llm_api_key(&self) -> Result<SecretValue, FinsightError> {
        require_env(&self.llm.api_key_env)
    }

    /// Vision settings fall back to the main model when not configured.
    pub fn vision_or_llm(&self) -> &LlmConfig {
        self.vision.as_ref().unwrap_or(&self.llm)
    }
}

/// Helper to load configuration with guard rails.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `FINSIGHT_CONFIG` environment variable.
    /// 3. `finsight.toml` in the current working directory.
    pub fn load(path: Option<PathBuf>) -> Result<Config, FinsightError> {
        let candidate = resolve_path(path);
        let raw = fs::read_to_string(&candidate)
            .map_err(|err| FinsightError::config_io(candidate.clone(), err))?;
        let config = Self::parse(&raw)?;

        // Secrets must be present at load time; inline keys are never accepted.
        require_env(&config.llm.api_key_env)?;
        if let Some(vision) = &config.vision {
            require_env(&vision.api_key_env)?;
        }
        if let Some(embedding) = &config.embedding {
            require_env(&embedding.api_key_env)?;
        }
        Ok(config)
    }

    /// Parse and validate a TOML document without touching the environment.
    pub fn parse(raw: &str) -> Result<Config, FinsightError> {
        let config: Config = toml::from_str(raw)
            .map_err(|err| FinsightError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), FinsightError> {
        if config.llm.api_key_env.trim().is_empty() {
            return Err(FinsightError::InvalidConfiguration(
                "llm.api_key_env must reference an environment variable".into(),
            ));
        }
        if config.runtime.max_rounds == 0 {
            return Err(FinsightError::InvalidConfiguration(
                "runtime.max_rounds must be at least 1".into(),
            ));
        }
        if config.refinement.max_iterations == 0 {
            return Err(FinsightError::InvalidConfiguration(
                "refinement.max_iterations must be at least 1".into(),
            ));
        }
        if config.pipeline.stage_concurrency == 0 {
            return Err(FinsightError::InvalidConfiguration(
                "pipeline.stage_concurrency must be at least 1".into(),
            ));
        }
        if let Some((service, _)) = config
            .rate_limits
            .iter()
            .find(|(_, interval)| !interval.is_finite() || **interval < 0.0)
        {
            return Err(FinsightError::InvalidConfiguration(format!(
                "rate_limits.{service} must be a non-negative number of seconds"
            )));
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path {
        return path;
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return PathBuf::from(from_env);
        }
    }

    Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key_env: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "RuntimeConfig::default_max_rounds")]
    pub max_rounds: u32,
    /// Resume each stream from its latest checkpoint when one exists.
    #[serde(default)]
    pub resume: bool,
}

impl RuntimeConfig {
    const fn default_max_rounds() -> u32 {
        20
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_rounds: Self::default_max_rounds(),
            resume: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefinementConfig {
    #[serde(default = "RefinementConfig::default_max_iterations")]
    pub max_iterations: u32,
}

impl RefinementConfig {
    const fn default_max_iterations() -> u32 {
        3
    }
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_iterations: Self::default_max_iterations(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryConfig::default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "RetryConfig::default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl RetryConfig {
    const fn default_max_attempts() -> u32 {
        5
    }

    const fn default_base_delay_ms() -> u64 {
        1_000
    }

    const fn default_max_delay_ms() -> u64 {
        32_000
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            base_delay_ms: Self::default_base_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "SandboxConfig::default_image")]
    pub image: String,
    #[serde(default = "SandboxConfig::default_docker_binary")]
    pub docker_binary: String,
    #[serde(default = "SandboxConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub memory_limit: Option<String>,
}

impl SandboxConfig {
    fn default_image() -> String {
        "finsight-python-sandbox:latest".to_string()
    }

    fn default_docker_binary() -> String {
        "docker".to_string()
    }

    const fn default_timeout_secs() -> u64 {
        120
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: Self::default_image(),
            docker_binary: Self::default_docker_binary(),
            timeout_secs: Self::default_timeout_secs(),
            memory_limit: Some("2g".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "PipelineConfig::default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default = "PipelineConfig::default_stage_concurrency")]
    pub stage_concurrency: usize,
    #[serde(default)]
    pub stage_timeout_secs: Option<u64>,
    #[serde(default = "PipelineConfig::default_log_retention_days")]
    pub log_retention_days: u64,
}

impl PipelineConfig {
    fn default_working_dir() -> PathBuf {
        PathBuf::from("data/run")
    }

    const fn default_stage_concurrency() -> usize {
        4
    }

    const fn default_log_retention_days() -> u64 {
        90
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.working_dir.join("checkpoints")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.working_dir.join("memory")
    }

    pub fn namespace_dir(&self) -> PathBuf {
        self.working_dir.join("namespaces")
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.working_dir.join("artifacts")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.working_dir.join("logs")
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            working_dir: Self::default_working_dir(),
            stage_concurrency: Self::default_stage_concurrency(),
            stage_timeout_secs: None,
            log_retention_days: Self::default_log_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}
