use crate::error::ModelError;
use crate::llm::{with_retries, RetryPolicy};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| ModelError::Malformed("embedding response was empty".to_string()))
    }
}

/// Query-time embedding never fails: a timeout or error degrades to the zero
/// vector so the search still runs.
pub async fn embed_query_or_zero(embedder: &dyn Embedder, text: &str, timeout: Duration) -> Vec<f32> {
    match tokio::time::timeout(timeout, embedder.embed(text)).await {
        Ok(Ok(vector)) => vector,
        Ok(Err(error)) => {
            warn!(model = embedder.model_id(), %error, "query embedding failed, using zero vector");
            vec![0.0; embedder.dimensions()]
        }
        Err(_) => {
            warn!(
                model = embedder.model_id(),
                timeout_ms = timeout.as_millis() as u64,
                "query embedding timed out, using zero vector"
            );
            vec![0.0; embedder.dimensions()]
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn model_id(&self) -> &str {
        "char-trigram"
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    timeout: Duration,
    retry: RetryPolicy,
}

impl OpenAiEmbedder {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        model: impl Into<String>,
        dimensions: usize,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, ModelError> {
        let api_key = api_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ModelError::MissingCredentials("OPENAI_API_KEY is not set".to_string()))?;

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ModelError::MissingCredentials("api key is not a valid header".to_string()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            client: Client::builder().timeout(timeout).default_headers(headers).build()?,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.into(),
            dimensions,
            timeout,
            retry,
        })
    }

    async fn send_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "model": self.model,
                "input": texts,
                "dimensions": self.dimensions,
            }))
            .send()
            .await
            .map_err(|error| ModelError::from_http(error, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|error| ModelError::from_http(error, self.timeout))?;
        parsed.into_vectors(texts.len(), self.dimensions)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        with_retries(self.retry, "embeddings", || self.send_once(texts)).await
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl EmbeddingResponse {
    fn into_vectors(mut self, expected: usize, dimensions: usize) -> Result<Vec<Vec<f32>>, ModelError> {
        if self.data.len() != expected {
            return Err(ModelError::Malformed(format!(
                "expected {expected} embeddings, got {}",
                self.data.len()
            )));
        }
        self.data.sort_by_key(|item| item.index);
        self.data
            .into_iter()
            .map(|item| {
                if item.embedding.len() == dimensions {
                    Ok(item.embedding)
                } else {
                    Err(ModelError::Malformed(format!(
                        "embedding has {} dimensions, expected {dimensions}",
                        item.embedding.len()
                    )))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StalledEmbedder;

    #[async_trait]
    impl Embedder for StalledEmbedder {
        fn model_id(&self) -> &str {
            "stalled"
        }

        fn dimensions(&self) -> usize {
            4
        }

        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed_text("Hydraulic pressure and flow");
        let second = embedder.embed_text("Hydraulic pressure and flow");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn batch_matches_input_length() -> Result<(), ModelError> {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vectors = embedder
            .embed_batch(&["abc".to_string(), "crimp height".to_string()])
            .await?;
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|vector| vector.len() == 32));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_query_embedding_degrades_to_zero_vector() {
        let vector = embed_query_or_zero(&StalledEmbedder, "crimp", Duration::from_secs(3)).await;
        assert_eq!(vector, vec![0.0; 4]);
    }

    #[test]
    fn response_is_reordered_by_index() -> Result<(), Box<dyn std::error::Error>> {
        let parsed: EmbeddingResponse = serde_json::from_value(json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        }))?;
        let vectors = parsed.into_vectors(2, 2)?;
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        Ok(())
    }

    #[test]
    fn wrong_dimensions_are_malformed() -> Result<(), Box<dyn std::error::Error>> {
        let parsed: EmbeddingResponse = serde_json::from_value(json!({
            "data": [{ "index": 0, "embedding": [1.0, 0.0, 0.0] }]
        }))?;
        assert!(matches!(parsed.into_vectors(1, 2), Err(ModelError::Malformed(_))));
        Ok(())
    }
}
