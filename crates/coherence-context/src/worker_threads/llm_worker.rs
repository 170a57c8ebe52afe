//! HTTP client for an OpenAI-compatible llama-server.
//!
//! Implements both capabilities: chat completions for text generation and
//! `/v1/embeddings` for vectors. Non-success statuses become errors; there is
//! no retry here.
use crate::capabilities::{Embedder, TextGenerator};
use crate::config::Config;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

pub struct LlamaServerClient {
    backend_url: String,
    model: String,
    embedding_model: String,
    max_tokens: u32,
    temperature: f32,
    http_client: reqwest::Client,
}

impl LlamaServerClient {
    pub fn new(backend_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let backend_url = backend_url.into().trim_end_matches('/').to_string();
        info!("LLM client initialized with backend: {}", backend_url);
        Ok(Self {
            backend_url,
            model: "local-llm".to_string(),
            embedding_model: "local-llm".to_string(),
            max_tokens: 1024,
            temperature: 0.2,
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?,
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(&config.llm_backend_url, Duration::from_secs(config.request_timeout_seconds))?
            .with_models(&config.llm_model, &config.embedding_model))
    }

    pub fn with_models(mut self, model: &str, embedding_model: &str) -> Self {
        self.model = model.to_string();
        self.embedding_model = embedding_model.to_string();
        self
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.backend_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.backend_url)
    }
}

#[async_trait]
impl TextGenerator for LlamaServerClient {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        debug!("Generating completion for prompt ({} chars)", prompt.len());
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: false,
        };
        let response = self
            .http_client
            .post(self.completions_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("LLM backend request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("LLM backend returned {}: {}", status, body));
        }
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse LLM response: {}", e))?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .ok_or_else(|| anyhow::anyhow!("LLM backend returned no choices"))
    }
}

#[async_trait]
impl Embedder for LlamaServerClient {
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Generating embeddings for {} text(s) via llama-server", texts.len());
        let request = EmbeddingRequest {
            model: self.embedding_model.clone(),
            input: texts.to_vec(),
        };
        let response = self
            .http_client
            .post(self.embeddings_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Embedding request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Embedding endpoint returned {}: {}", status, body));
        }
        let embedding_response: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse embedding response: {}", e))?;

        let mut data = embedding_response.data;
        if data.len() != texts.len() {
            return Err(anyhow::anyhow!(
                "Embedding endpoint returned {} vectors for {} inputs",
                data.len(),
                texts.len()
            ));
        }
        data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
        let embeddings: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();
        debug!(
            "Generated {} embeddings (dim={})",
            embeddings.len(),
            embeddings.first().map(|e| e.len()).unwrap_or(0)
        );
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> LlamaServerClient {
        LlamaServerClient::new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_generate_reads_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"1. A fact."}}]}"#)
            .create_async()
            .await;

        let text = client(&server.url()).generate("prompt").await.unwrap();
        assert_eq!(text, "1. A fact.");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("loading model")
            .create_async()
            .await;

        let err = client(&server.url()).generate("prompt").await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_embed_batch_orders_by_index() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/embeddings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"index":1,"embedding":[0.0,1.0]},{"index":0,"embedding":[1.0,0.0]}]}"#)
            .create_async()
            .await;

        let vectors = client(&server.url())
            .embed_batch(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_embed_count_mismatch_is_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/embeddings")
            .with_status(200)
            .with_body(r#"{"data":[{"embedding":[1.0]}]}"#)
            .create_async()
            .await;

        let result = client(&server.url())
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        let vectors = client("http://127.0.0.1:9").embed_batch(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }
}
