use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{SandboxExecutor, SandboxOutput, SandboxRequest, SandboxResult, ensure_relpath};
use crate::config::SandboxConfig;
use crate::metrics::record_sandbox;

#[derive(Debug, Clone)]
pub enum DockerRuntimeUser {
    CurrentUser,
    Explicit(String),
}

#[derive(Debug, Clone)]
pub struct DockerSandboxConfig {
    pub image: String,
    pub docker_binary: String,
    pub workspace_root: PathBuf,
    pub memory_limit: Option<String>,
    pub cpus: Option<String>,
    pub tmpfs_size: String,
    pub pids_limit: u32,
    pub env: Vec<(String, String)>,
    pub read_only_root: bool,
    pub disable_network: bool,
    pub python_binary: String,
    pub user: DockerRuntimeUser,
}

impl DockerSandboxConfig {
    pub fn from_settings(settings: &SandboxConfig, workspace_root: PathBuf) -> Self {
        Self {
            image: settings.image.clone(),
            docker_binary: settings.docker_binary.clone(),
            memory_limit: settings.memory_limit.clone(),
            workspace_root,
            ..Self::default()
        }
    }
}

impl Default for DockerSandboxConfig {
    fn default() -> Self {
        Self {
            image: "finsight-python-sandbox:latest".to_string(),
            docker_binary: "docker".to_string(),
            workspace_root: std::env::temp_dir().join("finsight_sandbox"),
            memory_limit: Some("2g".to_string()),
            cpus: Some("2".to_string()),
            tmpfs_size: "512m".to_string(),
            pids_limit: 256,
            env: vec![
                ("MPLBACKEND".to_string(), "Agg".to_string()),
                ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
            ],
            read_only_root: true,
            disable_network: true,
            python_binary: "python".to_string(),
            user: DockerRuntimeUser::CurrentUser,
        }
    }
}

/// Runs each request in a fresh, network-less container.
#[derive(Debug)]
pub struct DockerSandboxRunner {
    config: DockerSandboxConfig,
    uid_gid: Option<String>,
    failure_streak: AtomicU64,
}

impl DockerSandboxRunner {
    pub fn new(config: DockerSandboxConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.workspace_root).with_context(|| {
            format!(
                "failed to create workspace root {}",
                config.workspace_root.display()
            )
        })?;

        let uid_gid = match &config.user {
            DockerRuntimeUser::CurrentUser => current_uid_gid(),
            DockerRuntimeUser::Explicit(user) => Some(user.clone()),
        };

        Ok(Self {
            config,
            uid_gid,
            failure_streak: AtomicU64::new(0),
        })
    }

    #[tracing::instrument(skip(self, request), fields(script = %request.script_name))]
    async fn execute_internal(&self, request: SandboxRequest) -> Result<SandboxResult> {
        request.validate()?;

        let workspace_dir = self.config.workspace_root.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&workspace_dir).with_context(|| {
            format!(
                "failed to create sandbox workspace {}",
                workspace_dir.display()
            )
        })?;
        let _guard = WorkspaceGuard::new(workspace_dir.clone());

        write_file(
            &workspace_dir,
            &request.script_name,
            request.script_contents.as_bytes(),
        )?;
        for file in &request.files {
            write_file(&workspace_dir, &file.path, &file.contents)?;
        }

        let docker_args = build_docker_args(
            &self.config,
            &workspace_dir,
            &request,
            self.uid_gid.as_deref(),
        );
        debug!(args = ?docker_args, "prepared docker invocation");

        let mut cmd = Command::new(&self.config.docker_binary);
        cmd.args(&docker_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        info!(image = %self.config.image, "starting sandbox execution");

        let mut child = cmd.spawn().context("failed to spawn docker process")?;
        let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        let (timed_out, status) = match time::timeout(request.timeout, child.wait()).await {
            Ok(wait_outcome) => (
                false,
                wait_outcome.context("failed to wait for docker process")?,
            ),
            Err(_elapsed) => {
                warn!("sandbox execution timed out; terminating container");
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill docker process after timeout");
                }
                let status = child
                    .wait()
                    .await
                    .context("failed to obtain exit status after timeout")?;
                (true, status)
            }
        };

        let stdout_bytes = stdout_task
            .await
            .context("failed to join stdout collection task")??;
        let stderr_bytes = stderr_task
            .await
            .context("failed to join stderr collection task")??;

        let exit_code = status.code();
        let duration = start.elapsed();

        let mut outputs = Vec::with_capacity(request.expected_outputs.len());
        for spec in &request.expected_outputs {
            let output_path = workspace_dir.join(&spec.path);
            match std::fs::read(&output_path) {
                Ok(bytes) => outputs.push(SandboxOutput {
                    spec: spec.clone(),
                    bytes,
                }),
                Err(err) => debug!(
                    path = %spec.path,
                    error = %err,
                    "expected output missing from sandbox workspace"
                ),
            }
        }

        let success = !timed_out && exit_code == Some(0);
        let failure_streak = if success {
            self.failure_streak.store(0, Ordering::Relaxed);
            0
        } else {
            let streak = self.failure_streak.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= 3 {
                error!(streak, "sandbox consecutive failure streak exceeded threshold");
            }
            streak
        };

        let status_label = if timed_out {
            "timeout"
        } else if success {
            "success"
        } else {
            "failure"
        };
        record_sandbox(
            status_label,
            duration.as_millis() as u64,
            outputs.len(),
            failure_streak,
        );
        info!(
            target: "telemetry.sandbox",
            status = status_label,
            exit_code,
            duration_ms = duration.as_millis() as u64,
            outputs = outputs.len(),
            failure_streak,
            "sandbox execution finished"
        );

        Ok(SandboxResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            outputs,
            timed_out,
            duration,
        })
    }
}

#[async_trait]
impl SandboxExecutor for DockerSandboxRunner {
    async fn execute(&self, request: SandboxRequest) -> Result<SandboxResult> {
        self.execute_internal(request).await
    }
}

fn build_docker_args(
    config: &DockerSandboxConfig,
    workspace_dir: &Path,
    request: &SandboxRequest,
    uid_gid: Option<&str>,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["run".into(), "--rm".into()];

    if config.disable_network {
        args.extend(["--network".into(), "none".into()]);
    }
    if let Some(memory) = &config.memory_limit {
        args.extend(["--memory".into(), memory.clone()]);
    }
    if let Some(cpus) = &config.cpus {
        args.extend(["--cpus".into(), cpus.clone()]);
    }

    args.extend([
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--cap-drop".into(),
        "ALL".into(),
        "--pids-limit".into(),
        config.pids_limit.to_string(),
    ]);

    if config.read_only_root {
        args.push("--read-only".into());
    }

    args.extend([
        "--tmpfs".into(),
        format!("/tmp:exec,mode=1777,size={}", config.tmpfs_size),
        "-v".into(),
        format!("{}:/workspace:rw", workspace_dir.display()),
        "-w".into(),
        "/workspace".into(),
    ]);

    for (key, value) in &config.env {
        args.extend(["--env".into(), format!("{key}={value}")]);
    }

    if let Some(user) = uid_gid {
        args.extend(["--user".into(), user.to_string()]);
    }

    args.push(config.image.clone());
    args.push(config.python_binary.clone());
    args.push(format!("/workspace/{}", request.script_name));
    args.extend(request.args.iter().cloned());

    args
}

fn write_file(base: &Path, rel: &str, contents: &[u8]) -> Result<()> {
    let full = base.join(ensure_relpath(rel)?);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    }
    std::fs::write(&full, contents)
        .with_context(|| format!("failed to write file {}", full.display()))
}

async fn read_pipe<R>(pipe: Option<R>) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buffer = Vec::new();
    if let Some(mut reader) = pipe {
        reader
            .read_to_end(&mut buffer)
            .await
            .context("failed to drain sandbox pipe")?;
    }
    Ok(buffer)
}

fn current_uid_gid() -> Option<String> {
    #[cfg(unix)]
    unsafe {
        Some(format!("{}:{}", libc::geteuid(), libc::getegid()))
    }
    #[cfg(not(unix))]
    {
        None
    }
}

struct WorkspaceGuard {
    path: PathBuf,
}

impl WorkspaceGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if self.path.exists()
            && let Err(err) = std::fs::remove_dir_all(&self.path)
        {
            warn!(
                path = %self.path.display(),
                error = %err,
                "failed to clean sandbox workspace"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxOutputSpec;
    use std::time::Duration;

    #[test]
    fn docker_args_lock_down_the_container() {
        let config = DockerSandboxConfig {
            user: DockerRuntimeUser::Explicit("1000:1000".to_string()),
            ..DockerSandboxConfig::default()
        };
        let mut request = SandboxRequest::new("runner.py", "print('hello')");
        request.args.push("--quiet".to_string());
        request.timeout = Duration::from_secs(5);

        let args = build_docker_args(&config, Path::new("/tmp/ws"), &request, Some("1000:1000"));

        let joined = args.join(" ");
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--pids-limit 256"));
        assert!(joined.contains("--security-opt no-new-privileges"));
        assert!(joined.contains("/tmp/ws:/workspace:rw"));
        assert!(joined.contains("--env MPLBACKEND=Agg"));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"/workspace/runner.py".to_string()));
        assert!(args.ends_with(&["--quiet".to_string()]));
    }

    #[test]
    fn settings_override_image_and_binary() {
        let settings = SandboxConfig {
            image: "custom:1".into(),
            docker_binary: "podman".into(),
            timeout_secs: 30,
            memory_limit: None,
        };
        let config = DockerSandboxConfig::from_settings(&settings, PathBuf::from("/tmp/x"));
        assert_eq!(config.image, "custom:1");
        assert_eq!(config.docker_binary, "podman");
        assert!(config.memory_limit.is_none());
        assert!(config.disable_network);
    }

    #[tokio::test]
    #[ignore]
    async fn docker_smoke_test() {
        if std::env::var("FINSIGHT_SANDBOX_TESTS").ok().as_deref() != Some("1") {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let runner = DockerSandboxRunner::new(DockerSandboxConfig {
            workspace_root: dir.path().to_path_buf(),
            ..DockerSandboxConfig::default()
        })
        .unwrap();
        let mut request =
            SandboxRequest::new("runner.py", "open('out.txt', 'w').write('ok')\nprint('done')");
        request.expected_outputs.push(SandboxOutputSpec::text("out.txt"));
        let result = runner.execute(request).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output("out.txt").and_then(|o| o.as_text()).as_deref(), Some("ok"));
    }
}
