//! Sentence embedding providers.
//!
//! The policy's state encoder needs a fixed-length vector per utterance.
//! Providers must be deterministic for identical input and model version.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

use crate::http::{client, default_base_url, send_json};

/// Error type for embedding operations.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited")]
    RateLimited,
    #[error("embedding request failed: {0}")]
    RequestFailed(String),
    #[error("embedding has {got} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl From<crate::provider::LlmError> for EmbedError {
    fn from(e: crate::provider::LlmError) -> Self {
        match e {
            crate::provider::LlmError::Unavailable(m) => Self::Unavailable(m),
            crate::provider::LlmError::RateLimited => Self::RateLimited,
            crate::provider::LlmError::RequestFailed(m) => Self::RequestFailed(m),
        }
    }
}

pub type EmbedFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EmbedError>> + Send + 'a>>;

/// Trait for sentence embedding backends.
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Output dimensionality. Fixed for the lifetime of the provider.
    fn dim(&self) -> usize;

    fn embed<'a>(&'a self, text: &'a str) -> EmbedFuture<'a, Vec<f32>>;

    /// Embed several texts. The default issues one request per text.
    fn embed_batch<'a>(&'a self, texts: &'a [String]) -> EmbedFuture<'a, Vec<Vec<f32>>> {
        Box::pin(async move {
            let mut out = Vec::with_capacity(texts.len());
            for text in texts {
                out.push(self.embed(text).await?);
            }
            Ok(out)
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbedder {
    model: String,
    dim: usize,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpEmbedder {
    pub fn new(model: String, dim: usize, api_key: String, base_url: Option<String>) -> Self {
        let base = base_url
            .unwrap_or_else(|| default_base_url(&model).to_owned());
        Self {
            model,
            dim,
            client: client(),
            base_url: base.trim_end_matches('/').to_owned(),
            api_key,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = EmbeddingRequest { model: &self.model, input: texts };
        let mut api: EmbeddingResponse =
            send_json(self.client.post(self.endpoint()).bearer_auth(&self.api_key).json(&body)).await?;
        if api.data.len() != texts.len() {
            return Err(EmbedError::RequestFailed(format!(
                "asked for {} embeddings, got {}",
                texts.len(),
                api.data.len()
            )));
        }
        api.data.sort_by_key(|d| d.index);

        let mut out = Vec::with_capacity(api.data.len());
        for datum in api.data {
            if datum.embedding.len() != self.dim {
                return Err(EmbedError::DimensionMismatch {
                    expected: self.dim,
                    got: datum.embedding.len(),
                });
            }
            out.push(datum.embedding);
        }
        Ok(out)
    }
}

impl EmbeddingProvider for HttpEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed<'a>(&'a self, text: &'a str) -> EmbedFuture<'a, Vec<f32>> {
        Box::pin(async move {
            let input = [text.to_owned()];
            let mut batch = self.request(&input).await?;
            batch.pop().ok_or_else(|| EmbedError::RequestFailed("empty embedding response".into()))
        })
    }

    fn embed_batch<'a>(&'a self, texts: &'a [String]) -> EmbedFuture<'a, Vec<Vec<f32>>> {
        Box::pin(self.request(texts))
    }
}

/// Build an embedder from `RAPPORT_EMBED_MODEL` / `RAPPORT_EMBED_DIM`,
/// sharing `RAPPORT_LLM_API_KEY` and `RAPPORT_LLM_BASE_URL` with the chat provider.
/// Returns `None` if the model, dimension or key is missing.
pub fn from_env() -> Option<HttpEmbedder> {
    let model = std::env::var("RAPPORT_EMBED_MODEL").ok()?;
    let dim = std::env::var("RAPPORT_EMBED_DIM").ok()?.parse().ok()?;
    let api_key = std::env::var("RAPPORT_LLM_API_KEY").ok()?;
    let base_url = std::env::var("RAPPORT_LLM_BASE_URL").ok();
    Some(HttpEmbedder::new(model, dim, api_key, base_url))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(usize);

    impl EmbeddingProvider for Constant {
        fn name(&self) -> &str {
            "constant"
        }

        fn dim(&self) -> usize {
            self.0
        }

        fn embed<'a>(&'a self, text: &'a str) -> EmbedFuture<'a, Vec<f32>> {
            let v = vec![text.len() as f32; self.0];
            Box::pin(async move { Ok(v) })
        }
    }

    #[tokio::test]
    async fn default_batch_embeds_each_text_in_order() {
        let p = Constant(3);
        let texts = vec!["a".to_string(), "abc".to_string()];
        let out = p.embed_batch(&texts).await.unwrap();
        assert_eq!(out, vec![vec![1.0; 3], vec![3.0; 3]]);
    }

    #[test]
    fn embeddings_endpoint_uses_vendor_base() {
        let e = HttpEmbedder::new("text-embedding-3-small".into(), 1536, "sk".into(), None);
        assert_eq!(e.endpoint(), "https://api.openai.com/v1/embeddings");
        let e = HttpEmbedder::new("m".into(), 8, "sk".into(), Some("http://localhost:8080/v1/".into()));
        assert_eq!(e.endpoint(), "http://localhost:8080/v1/embeddings");
    }

    #[test]
    fn llm_errors_map_onto_embed_errors() {
        let e: EmbedError = crate::provider::LlmError::RateLimited.into();
        assert!(matches!(e, EmbedError::RateLimited));
    }

    #[tokio::test]
    async fn empty_batch_skips_the_network() {
        let e = HttpEmbedder::new("m".into(), 8, "sk".into(), Some("http://127.0.0.1:9".into()));
        assert!(e.embed_batch(&[]).await.unwrap().is_empty());
    }
}
