//! External capabilities consumed by the core: text generation and embeddings.
//!
//! Both may fail at any call. Retry policy belongs to the implementation, never
//! to the callers inside this crate.

use async_trait::async_trait;

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Run a single prompt and return the raw completion text.
    async fn generate(&self, prompt: &str) -> anyhow::Result<String>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed every text; the output is index-aligned with the input.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Embedding backend returned no vector"))
    }
}
