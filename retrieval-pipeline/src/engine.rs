use std::sync::Arc;

use common::datasource::{DatasourceId, DatasourceKind};
use common::error::EngineError;
use common::plugin::sql::{SqlExecutionResult, SqlValue};
use common::plugin::PluginRegistry;
use common::project::ProjectLayout;

use crate::contexts::{self, DatasourceContext};
use crate::retrieve::{RagMode, RetrieveService, SearchMode};
use crate::search::SearchResult;

/// Facade over a built project: context documents, search, and ad-hoc SQL
/// against SQL-capable datasources.
pub struct ContextEngine {
    layout: ProjectLayout,
    registry: Arc<PluginRegistry>,
    retrieve_service: RetrieveService,
}

impl ContextEngine {
    pub fn new(
        layout: ProjectLayout,
        registry: Arc<PluginRegistry>,
        retrieve_service: RetrieveService,
    ) -> Self {
        Self {
            layout,
            registry,
            retrieve_service,
        }
    }

    pub async fn search_context(
        &self,
        text: &str,
        limit: Option<usize>,
        datasource_ids: Option<&[DatasourceId]>,
        rag_mode: RagMode,
        search_mode: SearchMode,
    ) -> Result<Vec<SearchResult>, EngineError> {
        self.retrieve_service
            .retrieve(text, limit, datasource_ids, rag_mode, search_mode)
            .await
    }

    pub fn get_all_contexts(&self) -> Result<Vec<DatasourceContext>, EngineError> {
        contexts::get_all_contexts(&self.layout)
    }

    pub fn get_datasource_context(
        &self,
        datasource_id: &DatasourceId,
    ) -> Result<DatasourceContext, EngineError> {
        contexts::get_datasource_context(&self.layout, datasource_id)
    }

    pub fn get_introspected_datasource_list(&self) -> Result<Vec<DatasourceId>, EngineError> {
        contexts::get_introspected_datasource_list(&self.layout)
    }

    pub fn get_all_contexts_formatted(&self) -> Result<String, EngineError> {
        contexts::get_all_contexts_formatted(&self.layout)
    }

    /// Execute SQL against a configured datasource, read-only by default.
    pub async fn run_sql(
        &self,
        datasource_id: &DatasourceId,
        sql: &str,
        params: &[SqlValue],
        read_only: bool,
    ) -> Result<SqlExecutionResult, EngineError> {
        if datasource_id.kind() != DatasourceKind::Config {
            return Err(EngineError::NotSupported(format!(
                "datasource {datasource_id} is a raw file and does not support SQL"
            )));
        }

        let config_path = self.layout.config_file_path(datasource_id);
        let raw = std::fs::read_to_string(&config_path).map_err(|_| {
            EngineError::NotFound(format!("no config file for datasource {datasource_id}"))
        })?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)?;
        let config = serde_json::to_value(yaml)?;

        let full_type = config
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "config for {datasource_id} has no 'type' field"
                ))
            })?;

        let plugin = self.registry.get(full_type).ok_or_else(|| {
            EngineError::NotSupported(format!("no plugin registered for type {full_type}"))
        })?;

        plugin.run_sql(&config, sql, params, read_only).await
    }
}
