use async_trait::async_trait;
use chrono::Utc;

use common::error::EngineError;
use common::plugin::{BuildExecutionResult, BuildPlugin, ChunkContent, EmbeddableChunk};

/// Fallback plugin for trivial datasources: the config document itself is
/// the result, divided into a single chunk.
pub struct DefaultBuildPlugin;

pub const DEFAULT_PLUGIN_NAME: &str = "default";

#[async_trait]
impl BuildPlugin for DefaultBuildPlugin {
    fn name(&self) -> &str {
        DEFAULT_PLUGIN_NAME
    }

    fn supported_types(&self) -> Vec<String> {
        vec!["custom/config".to_string()]
    }

    async fn execute(
        &self,
        full_type: &str,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<BuildExecutionResult, EngineError> {
        Ok(BuildExecutionResult {
            id: None,
            name: name.to_owned(),
            full_type: full_type.to_owned(),
            executed_at: Utc::now(),
            version: None,
            description: None,
            result: config.clone(),
        })
    }

    fn divide_into_chunks(
        &self,
        result: &BuildExecutionResult,
    ) -> Result<Vec<EmbeddableChunk>, EngineError> {
        let content = ChunkContent::Structured(result.result.clone());
        Ok(vec![EmbeddableChunk::new(content.render_display(), content)])
    }
}
