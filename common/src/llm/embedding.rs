use async_openai::types::CreateEmbeddingRequestArgs;
use async_trait::async_trait;
use tracing::debug;

use crate::config::AppConfig;
use crate::error::EngineError;

/// Generates embedding vectors for chunk and query text.
///
/// Implementations declare the identity of the vector space they write into:
/// the embedder label, the model id and the dimension. The store keys its
/// vector shards on (embedder, model_id), so these must be stable.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn embedder(&self) -> &str;
    fn model_id(&self) -> &str;
    fn dim(&self) -> usize;

    async fn embed(&self, input: &str) -> Result<Vec<f32>, EngineError>;
}

/// Embedding provider backed by the OpenAI embeddings API (or any
/// OpenAI-compatible endpoint via `openai_base_url`).
pub struct OpenAiEmbeddingProvider {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
    embedder: String,
    model_id: String,
    dim: usize,
}

impl OpenAiEmbeddingProvider {
    pub fn new(
        client: async_openai::Client<async_openai::config::OpenAIConfig>,
        embedder: impl Into<String>,
        model_id: impl Into<String>,
        dim: usize,
    ) -> Self {
        Self {
            client,
            embedder: embedder.into(),
            model_id: model_id.into(),
            dim,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let client = async_openai::Client::with_config(
            async_openai::config::OpenAIConfig::new()
                .with_api_key(&config.openai_api_key)
                .with_api_base(&config.openai_base_url),
        );
        Self::new(
            client,
            config.embedder.clone(),
            config.embedding_model.clone(),
            config.embedding_dimensions,
        )
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn embedder(&self) -> &str {
        &self.embedder
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, input: &str) -> Result<Vec<f32>, EngineError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model_id)
            .dimensions(self.dim as u32)
            .input([input])
            .build()
            .map_err(EngineError::from)?;

        let response = self.client.embeddings().create(request).await?;

        let embedding: Vec<f32> = response
            .data
            .first()
            .ok_or_else(|| {
                EngineError::PermanentProvider("No embedding data received".into())
            })?
            .embedding
            .clone();

        debug!(dimensions = embedding.len(), "Embedding was created");

        Ok(embedding)
    }
}
