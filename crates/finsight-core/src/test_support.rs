//! Scripted fakes shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;

use crate::llm::{ChatMessage, InferenceClient, InferenceError};
use crate::refine::{CritiqueVerdict, VisionEvaluator};
use crate::sandbox::{
    RESULT_FILE, STATE_OUT, SandboxExecutor, SandboxOutput, SandboxOutputSpec, SandboxRequest,
    SandboxResult,
};

/// Sandbox executor replaying canned results in order.
pub(crate) struct ScriptedExecutor {
    results: Mutex<VecDeque<SandboxResult>>,
    pub(crate) requests: Mutex<Vec<SandboxRequest>>,
}

impl ScriptedExecutor {
    pub(crate) fn new(results: Vec<SandboxResult>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SandboxExecutor for ScriptedExecutor {
    async fn execute(&self, request: SandboxRequest) -> anyhow::Result<SandboxResult> {
        self.requests.lock().unwrap().push(request);
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted sandbox result left"))
    }
}

/// What the in-sandbox runner leaves behind for one snippet.
pub(crate) fn runner_result(ok: bool, stdout: &str, state: &[u8]) -> SandboxResult {
    let error = (!ok).then_some("Traceback: NameError: name 'x' is not defined");
    let body = json!({
        "ok": ok,
        "stdout": stdout,
        "error": error,
        "variables": [{"name": "revenue", "type": "list", "preview": "[1, 2]"}],
    });
    SandboxResult {
        exit_code: Some(0),
        stdout: String::new(),
        stderr: String::new(),
        outputs: vec![
            SandboxOutput {
                spec: SandboxOutputSpec::binary(STATE_OUT),
                bytes: state.to_vec(),
            },
            SandboxOutput {
                spec: SandboxOutputSpec::text(RESULT_FILE),
                bytes: serde_json::to_vec(&body).unwrap(),
            },
        ],
        timed_out: false,
        duration: Duration::from_millis(15),
    }
}

/// Runner result that also carries a rendered chart.
pub(crate) fn chart_result(png: &[u8]) -> SandboxResult {
    let mut result = runner_result(true, "saved chart.png", b"state");
    result.outputs.push(SandboxOutput {
        spec: SandboxOutputSpec::binary("chart.png"),
        bytes: png.to_vec(),
    });
    result
}

/// Inference client answering from a queue; records every request.
pub(crate) struct ScriptedInference {
    replies: Mutex<VecDeque<Result<String, InferenceError>>>,
    pub(crate) requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedInference {
    pub(crate) fn new(replies: Vec<Result<String, InferenceError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn replies(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|text| Ok(text.to_string())).collect())
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl InferenceClient for ScriptedInference {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, InferenceError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(InferenceError::Invalid("script exhausted".into())))
    }
}

/// Vision evaluator returning canned verdicts.
pub(crate) struct ScriptedVision {
    verdicts: Mutex<VecDeque<anyhow::Result<CritiqueVerdict>>>,
    calls: AtomicUsize,
}

impl ScriptedVision {
    pub(crate) fn new(verdicts: Vec<anyhow::Result<CritiqueVerdict>>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionEvaluator for ScriptedVision {
    async fn evaluate(&self, _image_png: &[u8], _rubric: &str) -> anyhow::Result<CritiqueVerdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(CritiqueVerdict::Finish))
    }
}
