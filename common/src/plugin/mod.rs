pub mod sql;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use self::sql::{SqlExecutionResult, SqlValue};

/// The payload a chunk carries besides its embeddable text.
///
/// Plain strings pass through the display formatter unchanged; structured
/// payloads (table descriptions, column descriptions, config documents) are
/// rendered to their YAML document form when surfaced to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkContent {
    Text(String),
    Structured(serde_json::Value),
}

impl ChunkContent {
    pub fn structured<T: Serialize>(value: &T) -> Result<Self, EngineError> {
        Ok(Self::Structured(serde_json::to_value(value)?))
    }

    /// Stable display rendering of the content.
    pub fn render_display(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(value) => {
                serde_yaml::to_string(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

/// An in-memory chunk before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddableChunk {
    pub embeddable_text: String,
    pub content: ChunkContent,
}

impl EmbeddableChunk {
    pub fn new(embeddable_text: impl Into<String>, content: ChunkContent) -> Self {
        Self {
            embeddable_text: embeddable_text.into(),
            content,
        }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            embeddable_text: text.clone(),
            content: ChunkContent::Text(text),
        }
    }
}

/// What a plugin produced for one datasource execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildExecutionResult {
    /// Plugin-provided stable id for the source, when it has one.
    pub id: Option<String>,
    pub name: String,
    pub full_type: String,
    pub executed_at: DateTime<Utc>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub result: serde_json::Value,
}

/// A datasource build plugin.
///
/// Plugins declare the `full_type` strings they can handle and turn a
/// datasource config (or raw file) into an execution result and a sequence
/// of embeddable chunks. SQL-capable plugins additionally expose connection
/// checks and ad-hoc query execution.
#[async_trait]
pub trait BuildPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn supported_types(&self) -> Vec<String>;

    async fn execute(
        &self,
        full_type: &str,
        name: &str,
        config: &serde_json::Value,
    ) -> Result<BuildExecutionResult, EngineError>;

    fn divide_into_chunks(
        &self,
        result: &BuildExecutionResult,
    ) -> Result<Vec<EmbeddableChunk>, EngineError>;

    async fn check_connection(
        &self,
        full_type: &str,
        _name: &str,
        _config: &serde_json::Value,
    ) -> Result<(), EngineError> {
        Err(EngineError::NotSupported(format!(
            "plugin '{}' does not support connection checks for {full_type}",
            self.name()
        )))
    }

    async fn run_sql(
        &self,
        _config: &serde_json::Value,
        _sql: &str,
        _params: &[SqlValue],
        _read_only: bool,
    ) -> Result<SqlExecutionResult, EngineError> {
        Err(EngineError::NotSupported(format!(
            "plugin '{}' does not support SQL execution",
            self.name()
        )))
    }
}

/// Registry of build plugins keyed by the `full_type` they declare.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn BuildPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn BuildPlugin>) {
        for full_type in plugin.supported_types() {
            self.plugins.insert(full_type, Arc::clone(&plugin));
        }
    }

    pub fn get(&self, full_type: &str) -> Option<Arc<dyn BuildPlugin>> {
        self.plugins.get(full_type).cloned()
    }

    pub fn supported_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.plugins.keys().cloned().collect();
        types.sort();
        types
    }
}
