use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use fastembed::TextEmbedding;

use super::Embedder;

/// Local ONNX embedding model.
pub struct FastEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
}

impl FastEmbedder {
    pub async fn new() -> Result<Self> {
        let model = tokio::task::spawn_blocking(|| -> Result<TextEmbedding> {
            let mut model = TextEmbedding::try_new(Default::default())
                .map_err(|err| anyhow!("failed to initialise FastEmbed model: {err}"))?;
            model
                .embed(vec!["finsight warmup"], Some(1))
                .map_err(|err| anyhow!("failed to warm up FastEmbed model: {err}"))?;
            Ok(model)
        })
        .await??;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let texts = texts.to_vec();
        let model = self.model.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut model = model
                .lock()
                .map_err(|_| anyhow!("embedding model poisoned"))?;
            model
                .embed(texts, Some(32))
                .map_err(|err| anyhow!("failed to embed memory entries: {err}"))
        })
        .await?
    }
}
