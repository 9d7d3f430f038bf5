//! Embedding adapter (C4): wraps `kg_ai_client`'s OpenAI-compatible embedding
//! endpoint behind a small `TextEmbedder` trait, so `kg-resolve`/`kg-extract`
//! can be tested against a mock instead of a live provider.

use kg_ai_client::openai::OpenAi;
use kg_ai_client::traits::EmbedAgent;
use std::time::Duration;
use thiserror::Error;

#[async_trait::async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbedError>;
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding provider error after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

/// Embedding adapter. Retries transient failures with exponential backoff;
/// on persistent failure the caller is expected to mark the affected node
/// `pending_embedding = true` rather than fail the whole task.
#[derive(Clone)]
pub struct Embedder {
    client: OpenAi,
    max_retries: u32,
    base_backoff: Duration,
}

impl Embedder {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let model = model.into();
        let client = OpenAi::new(api_key.into(), model.clone()).with_embedding_model(model);
        Self { client, max_retries: 3, base_backoff: Duration::from_millis(200) }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.client = self.client.with_base_url(url);
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    async fn with_retry<T, F, Fut>(&self, f: F) -> Result<T, EmbedError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            match f().await {
                Ok(v) => return Ok(l2_normalize_result(v)),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < self.max_retries {
                        let backoff = self.base_backoff * 2u32.pow(attempt);
                        tracing::warn!(attempt, error = %last_error, "embedding call failed, retrying");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(EmbedError::Exhausted { attempts: self.max_retries + 1, last_error })
    }
}

/// Placeholder identity hook so `with_retry`'s generic signature stays
/// uniform between the single and batch embed paths; real normalization
/// happens in `l2_normalize`/`l2_normalize_batch` below.
fn l2_normalize_result<T>(v: T) -> T {
    v
}

/// L2-normalize a single embedding vector in place.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[async_trait::async_trait]
impl TextEmbedder for Embedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let text = text.to_string();
        let mut v = self.with_retry(|| {
            let client = &self.client;
            let text = text.clone();
            async move { client.embed(text).await }
        }).await?;
        l2_normalize(&mut v);
        Ok(v)
    }

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut vectors = self.with_retry(|| {
            let client = &self.client;
            let texts = texts.clone();
            async move { client.embed_batch(texts).await }
        }).await?;
        for v in vectors.iter_mut() {
            l2_normalize(v);
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_normalize_yields_unit_vector() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_leaves_zero_vector_alone() {
        let mut v = vec![0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }
}
