//! Inference capability seam.

mod openai;

pub use openai::{OpenAiClient, OpenAiEmbedder, OpenAiVision};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::capability::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    /// Network errors, timeouts, throttling and server errors.
    #[error("transient inference failure: {0}")]
    Transient(String),
    #[error("inference authentication failed: {0}")]
    Auth(String),
    #[error("request exceeds the model context window: {0}")]
    ContextOverflow(String),
    #[error("invalid inference response: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, InferenceError>;
}

/// Call `client` with transient-failure retries and context-overflow recovery.
///
/// On overflow the oldest message after the first `protected_prefix` messages
/// is dropped from the request (never the newest one) and the call is
/// repeated. The caller's history is left untouched.
pub async fn complete_with_retry(
    client: &dyn InferenceClient,
    messages: &[ChatMessage],
    retry: &RetryPolicy,
    protected_prefix: usize,
) -> Result<String, InferenceError> {
    let mut request = messages.to_vec();
    let mut attempt = 0;
    loop {
        match client.complete(&request).await {
            Ok(text) => return Ok(text),
            Err(InferenceError::Transient(message)) => {
                attempt += 1;
                if attempt >= retry.max_attempts() {
                    return Err(InferenceError::Transient(message));
                }
                let delay = retry.delay_for(attempt - 1);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "transient inference failure; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(InferenceError::ContextOverflow(message)) => {
                let droppable = protected_prefix < request.len().saturating_sub(1);
                if !droppable {
                    return Err(InferenceError::ContextOverflow(message));
                }
                request.remove(protected_prefix);
                warn!(
                    remaining = request.len(),
                    "context window exceeded; dropped oldest message from request"
                );
            }
            Err(other) => return Err(other),
        }
    }
}
