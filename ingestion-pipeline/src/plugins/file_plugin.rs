use async_trait::async_trait;
use chrono::Utc;
use text_splitter::TextSplitter;

use common::error::EngineError;
use common::plugin::{BuildExecutionResult, BuildPlugin, EmbeddableChunk};

pub const FILE_PLUGIN_NAME: &str = "files";

const SUPPORTED_EXTENSIONS: [&str; 6] = ["txt", "md", "csv", "json", "yaml", "log"];

/// Raw-file datasources: the file's text is the context, split into
/// fixed-capacity chunks.
pub struct FileBuildPlugin {
    max_chunk_chars: usize,
}

impl FileBuildPlugin {
    pub fn new(max_chunk_chars: usize) -> Self {
        Self { max_chunk_chars }
    }
}

#[async_trait]
impl BuildPlugin for FileBuildPlugin {
    fn name(&self) -> &str {
        FILE_PLUGIN_NAME
    }

    fn supported_types(&self) -> Vec<String> {
        SUPPORTED_EXTENSIONS
            .iter()
            .map(|ext| format!("files/{ext}"))
            .collect()
    }

    async fn execute(
        &self,
        full_type: &str,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<BuildExecutionResult, EngineError> {
        let path = config
            .get("path")
            .and_then(|p| p.as_str())
            .ok_or_else(|| {
                EngineError::Validation("file datasource config has no 'path'".into())
            })?;
        let text = std::fs::read_to_string(path)?;

        Ok(BuildExecutionResult {
            id: None,
            name: name.to_owned(),
            full_type: full_type.to_owned(),
            executed_at: Utc::now(),
            version: None,
            description: None,
            result: serde_json::json!({
                "path": path,
                "text": text,
            }),
        })
    }

    fn divide_into_chunks(
        &self,
        result: &BuildExecutionResult,
    ) -> Result<Vec<EmbeddableChunk>, EngineError> {
        let text = result
            .result
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let splitter = TextSplitter::new(self.max_chunk_chars);
        Ok(splitter
            .chunks(text)
            .map(EmbeddableChunk::from_text)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splits_file_text_into_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("notes.txt");
        let text = "first paragraph about users.\n\nsecond paragraph about orders.";
        std::fs::write(&path, text).expect("write");

        let plugin = FileBuildPlugin::new(40);
        let config = serde_json::json!({"path": path.to_string_lossy()});
        let result = plugin
            .execute("files/txt", "notes.txt", &config)
            .await
            .expect("execute");

        let chunks = plugin.divide_into_chunks(&result).expect("chunks");
        assert!(chunks.len() >= 2);
        assert!(chunks[0].embeddable_text.contains("first paragraph"));
    }

    #[tokio::test]
    async fn empty_files_produce_no_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, "").expect("write");

        let plugin = FileBuildPlugin::new(1000);
        let config = serde_json::json!({"path": path.to_string_lossy()});
        let result = plugin
            .execute("files/txt", "empty.txt", &config)
            .await
            .expect("execute");

        assert!(plugin.divide_into_chunks(&result).expect("chunks").is_empty());
    }
}
