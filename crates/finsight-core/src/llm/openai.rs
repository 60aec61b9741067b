use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::instrument;

use super::{ChatMessage, InferenceClient, InferenceError};
use crate::config::{EmbeddingConfig, LlmConfig};
use crate::memory::Embedder;
use crate::refine::{CritiqueVerdict, VisionEvaluator};
use crate::{FinsightError, SecretValue, require_env};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

fn http_client() -> Result<reqwest::Client, FinsightError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|err| FinsightError::InvalidConfiguration(format!("http client: {err}")))
}

/// Map a non-success response onto the inference error taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> InferenceError {
    let lowered = body.to_lowercase();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            InferenceError::Auth(format!("{status}: {}", excerpt(body)))
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            InferenceError::Transient(format!("{status}: {}", excerpt(body)))
        }
        status if status.is_server_error() => {
            InferenceError::Transient(format!("{status}: {}", excerpt(body)))
        }
        StatusCode::BAD_REQUEST
            if lowered.contains("context length")
                || lowered.contains("context_length")
                || lowered.contains("maximum context")
                || lowered.contains("too many tokens") =>
        {
            InferenceError::ContextOverflow(excerpt(body))
        }
        status => InferenceError::Invalid(format!("{status}: {}", excerpt(body))),
    }
}

fn excerpt(body: &str) -> String {
    body.chars().take(300).collect()
}

/// Chat completions against an OpenAI-compatible endpoint.
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: SecretValue,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl OpenAiClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, FinsightError> {
        Ok(Self {
            http: http_client()?,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: require_env(&config.api_key_env)?,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    async fn post_chat(&self, messages: Value) -> Result<String, InferenceError> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", self.api_key.bearer())
            .json(&body)
            .send()
            .await
            .map_err(|err| InferenceError::Transient(err.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| InferenceError::Transient(err.to_string()))?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|err| InferenceError::Invalid(format!("unexpected response body: {err}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| InferenceError::Invalid("response carried no message content".into()))
    }
}

#[async_trait]
impl InferenceClient for OpenAiClient {
    #[instrument(skip(self, messages), fields(model = %self.model, messages = messages.len()))]
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, InferenceError> {
        let payload = serde_json::to_value(messages)
            .map_err(|err| InferenceError::Invalid(err.to_string()))?;
        self.post_chat(payload).await
    }
}

/// Vision model used to critique rendered charts.
pub struct OpenAiVision {
    chat: OpenAiClient,
}

impl OpenAiVision {
    pub fn from_config(config: &LlmConfig) -> Result<Self, FinsightError> {
        Ok(Self {
            chat: OpenAiClient::from_config(config)?,
        })
    }
}

#[async_trait]
impl VisionEvaluator for OpenAiVision {
    async fn evaluate(&self, image_png: &[u8], rubric: &str) -> anyhow::Result<CritiqueVerdict> {
        let data_url = format!("data:image/png;base64,{}", STANDARD.encode(image_png));
        let messages = json!([{
            "role": "user",
            "content": [
                {"type": "text", "text": rubric},
                {"type": "image_url", "image_url": {"url": data_url}},
            ],
        }]);
        let reply = self
            .chat
            .post_chat(messages)
            .await
            .context("vision evaluation request failed")?;
        Ok(CritiqueVerdict::parse(&reply))
    }
}

/// Remote embedding model behind an OpenAI-compatible `/embeddings` route.
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: SecretValue,
}

impl OpenAiEmbedder {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, FinsightError> {
        Ok(Self {
            http: http_client()?,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: require_env(&config.api_key_env)?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", self.api_key.bearer())
            .json(&json!({"model": self.model, "input": texts}))
            .send()
            .await
            .context("embedding request failed")?;
        let status = response.status();
        let text = response.text().await.context("embedding response unreadable")?;
        if !status.is_success() {
            return Err(anyhow!(classify_status(status, &text)));
        }
        let mut parsed: EmbeddingResponse =
            serde_json::from_str(&text).context("unexpected embedding response")?;
        if parsed.data.len() != texts.len() {
            return Err(anyhow!(
                "embedding endpoint returned {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            ));
        }
        parsed.data.sort_by_key(|row| row.index);
        Ok(parsed.data.into_iter().map(|row| row.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_error_classes() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "bad key"),
            InferenceError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            InferenceError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            InferenceError::Transient(_)
        ));
        assert!(matches!(
            classify_status(
                StatusCode::BAD_REQUEST,
                r#"{"error":{"message":"This model's maximum context length is 128000 tokens"}}"#
            ),
            InferenceError::ContextOverflow(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "unknown field"),
            InferenceError::Invalid(_)
        ));
    }

    #[test]
    fn chat_messages_serialize_with_lowercase_roles() {
        let value = serde_json::to_value([ChatMessage::system("hi")]).unwrap();
        assert_eq!(value[0]["role"], "system");
        assert_eq!(value[0]["content"], "hi");
    }
}
