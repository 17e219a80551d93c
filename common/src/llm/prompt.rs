use std::sync::Arc;

use async_openai::types::{
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;

use crate::config::AppConfig;
use crate::error::EngineError;

/// Sends a single prompt to a generation model and returns its text answer.
#[async_trait]
pub trait PromptProvider: Send + Sync {
    async fn prompt(&self, prompt: &str) -> Result<String, EngineError>;
}

/// Prompt provider backed by the OpenAI chat completions API.
pub struct OpenAiPromptProvider {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
    model: String,
}

impl OpenAiPromptProvider {
    pub fn new(
        client: async_openai::Client<async_openai::config::OpenAIConfig>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let client = async_openai::Client::with_config(
            async_openai::config::OpenAIConfig::new()
                .with_api_key(&config.openai_api_key)
                .with_api_base(&config.openai_base_url),
        );
        Self::new(client, config.chat_model.clone())
    }
}

#[async_trait]
impl PromptProvider for OpenAiPromptProvider {
    async fn prompt(&self, prompt: &str) -> Result<String, EngineError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()
                .map_err(EngineError::from)?
                .into()])
            .build()
            .map_err(EngineError::from)?;

        let response = self.client.chat().create(request).await?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| EngineError::PermanentProvider("No completion content received".into()))
    }
}

const DESCRIPTION_SYSTEM_PROMPT: &str = "You write one-sentence descriptions of database \
schema elements and documents for a search index. Answer with the description only.";

/// Produces a short generated description for a chunk, given the rendered
/// context document it came from.
pub struct DescriptionProvider {
    prompts: Arc<dyn PromptProvider>,
}

impl DescriptionProvider {
    pub fn new(prompts: Arc<dyn PromptProvider>) -> Self {
        Self { prompts }
    }

    pub async fn describe(&self, text: &str, context: &str) -> Result<String, EngineError> {
        let prompt = format!(
            "{DESCRIPTION_SYSTEM_PROMPT}\n\nContext document:\n{context}\n\nDescribe:\n{text}"
        );
        self.prompts.prompt(&prompt).await
    }
}
