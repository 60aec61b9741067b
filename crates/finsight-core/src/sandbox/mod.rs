//! Isolated code execution.
//!
//! [`SandboxExecutor`] runs one script in a throwaway workspace;
//! [`CodeSandbox`] layers a persistent per-run [`Namespace`] on top of it.

mod docker;
mod namespace;
mod python;

pub use docker::{DockerRuntimeUser, DockerSandboxConfig, DockerSandboxRunner};
pub use namespace::{Namespace, NamespaceSnapshot};
pub use python::{CodeSandbox, ExecutionReport, VariableSummary};
#[cfg(test)]
pub(crate) use python::{RESULT_FILE, STATE_OUT};

use std::path::{Component, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SandboxOutputKind {
    Binary,
    Text,
}

/// A file the caller wants back from the sandbox workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxOutputSpec {
    pub path: String,
    pub kind: SandboxOutputKind,
}

impl SandboxOutputSpec {
    pub fn new(path: impl Into<String>, kind: SandboxOutputKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }

    pub fn binary(path: impl Into<String>) -> Self {
        Self::new(path, SandboxOutputKind::Binary)
    }

    pub fn text(path: impl Into<String>) -> Self {
        Self::new(path, SandboxOutputKind::Text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxFile {
    pub path: String,
    pub contents: Vec<u8>,
}

impl SandboxFile {
    pub fn new(path: impl Into<String>, contents: impl AsRef<[u8]>) -> Self {
        Self {
            path: path.into(),
            contents: contents.as_ref().to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub script_name: String,
    pub script_contents: String,
    pub args: Vec<String>,
    pub files: Vec<SandboxFile>,
    pub expected_outputs: Vec<SandboxOutputSpec>,
    pub timeout: Duration,
}

impl SandboxRequest {
    pub fn new(script_name: impl Into<String>, script_contents: impl Into<String>) -> Self {
        Self {
            script_name: script_name.into(),
            script_contents: script_contents.into(),
            args: Vec::new(),
            files: Vec::new(),
            expected_outputs: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure_relpath(&self.script_name)
            .with_context(|| format!("script name '{}' must be relative", self.script_name))?;
        if self.script_contents.trim().is_empty() {
            return Err(anyhow!("script_contents must not be empty"));
        }
        for file in &self.files {
            ensure_relpath(&file.path)
                .with_context(|| format!("file path '{}' must be relative", file.path))?;
        }
        for spec in &self.expected_outputs {
            ensure_relpath(&spec.path)
                .with_context(|| format!("output path '{}' must be relative", spec.path))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub spec: SandboxOutputSpec,
    pub bytes: Vec<u8>,
}

impl SandboxOutput {
    pub fn as_text(&self) -> Option<String> {
        if self.spec.kind == SandboxOutputKind::Text {
            Some(String::from_utf8_lossy(&self.bytes).into_owned())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub outputs: Vec<SandboxOutput>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl SandboxResult {
    pub fn output(&self, path: &str) -> Option<&SandboxOutput> {
        self.outputs.iter().find(|output| output.spec.path == path)
    }
}

#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn execute(&self, request: SandboxRequest) -> Result<SandboxResult>;
}

pub(crate) fn ensure_relpath(path: &str) -> Result<PathBuf> {
    let pb = PathBuf::from(path);
    if pb.is_absolute() {
        return Err(anyhow!("path may not be absolute"));
    }
    if pb.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(anyhow!("path may not contain parent components (..)"));
    }
    Ok(pb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_rejects_escaping_paths() {
        let mut request = SandboxRequest::new("runner.py", "print(1)");
        assert!(request.validate().is_ok());

        request.files.push(SandboxFile::new("../secrets.txt", b"x"));
        assert!(request.validate().is_err());

        let absolute = SandboxRequest::new("/etc/runner.py", "print(1)");
        assert!(absolute.validate().is_err());
    }

    #[test]
    fn empty_script_is_rejected() {
        assert!(SandboxRequest::new("runner.py", "  ").validate().is_err());
    }
}
