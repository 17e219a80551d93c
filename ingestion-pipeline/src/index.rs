use std::sync::Arc;

use tracing::{info, warn};
use walkdir::WalkDir;

use common::datasource::DatasourceId;
use common::error::EngineError;
use common::plugin::{BuildExecutionResult, PluginRegistry};
use common::project::ProjectLayout;
use common::storage::db::SurrealDbClient;
use common::storage::types::datasource_run::{DatasourceRun, NewDatasourceRun};
use common::storage::types::run::{Run, RunStatus};

use crate::build::ENGINE_VERSION;
use crate::context_file;
use crate::embedding_service::ChunkEmbeddingService;

#[derive(Debug)]
pub struct IndexDatasourceOutcome {
    pub datasource_id: DatasourceId,
    pub full_type: String,
    pub chunk_count: usize,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct IndexSummary {
    pub run_id: i64,
    pub status: RunStatus,
    pub outcomes: Vec<IndexDatasourceOutcome>,
}

/// Re-indexes already built context documents: reads the latest run's
/// output, re-chunks each document through its plugin and persists chunks
/// and embeddings, without executing the plugins against the datasources
/// again.
pub struct ContextIndexer {
    db: Arc<SurrealDbClient>,
    layout: ProjectLayout,
    registry: Arc<PluginRegistry>,
    embedding_service: ChunkEmbeddingService,
}

impl ContextIndexer {
    pub fn new(
        db: Arc<SurrealDbClient>,
        layout: ProjectLayout,
        registry: Arc<PluginRegistry>,
        embedding_service: ChunkEmbeddingService,
    ) -> Self {
        Self {
            db,
            layout,
            registry,
            embedding_service,
        }
    }

    pub async fn index_built_contexts(
        &self,
        datasource_ids: Option<&[DatasourceId]>,
    ) -> Result<IndexSummary, EngineError> {
        let run_dir = self.layout.latest_run_dir()?.ok_or_else(|| {
            EngineError::NotFound("no built contexts to index; run a build first".into())
        })?;

        let project_id = self
            .layout
            .project_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());

        let run = Run::begin(&self.db, &project_id, ENGINE_VERSION).await?;
        info!(run_id = run.run_id, "Context indexing started");

        let mut outcomes = Vec::new();
        for entry in WalkDir::new(&run_dir).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&run_dir) else {
                continue;
            };
            let Ok(datasource_id) = DatasourceId::from_context_file_path(relative) else {
                continue;
            };
            if let Some(wanted) = datasource_ids {
                if !wanted.contains(&datasource_id) {
                    continue;
                }
            }

            let content = std::fs::read_to_string(entry.path())?;
            let outcome = match self
                .index_context(run.run_id, &run_dir, &datasource_id, &content)
                .await
            {
                Ok((full_type, chunk_count)) => IndexDatasourceOutcome {
                    datasource_id,
                    full_type,
                    chunk_count,
                    error: None,
                },
                Err(err) => {
                    warn!(
                        datasource_id = %datasource_id,
                        error = %err,
                        "Indexing a context failed; continuing with the next one"
                    );
                    IndexDatasourceOutcome {
                        datasource_id,
                        full_type: String::new(),
                        chunk_count: 0,
                        error: Some(err.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        Run::finalize(&self.db, run.run_id, RunStatus::Success).await?;
        info!(run_id = run.run_id, indexed = outcomes.len(), "Context indexing finished");

        Ok(IndexSummary {
            run_id: run.run_id,
            status: RunStatus::Success,
            outcomes,
        })
    }

    async fn index_context(
        &self,
        run_id: i64,
        run_dir: &std::path::Path,
        datasource_id: &DatasourceId,
        content: &str,
    ) -> Result<(String, usize), EngineError> {
        let result: BuildExecutionResult = context_file::parse_context_document(content)?;

        let plugin = self.registry.get(&result.full_type).ok_or_else(|| {
            EngineError::NotSupported(format!(
                "no plugin registered for type {}",
                result.full_type
            ))
        })?;

        let chunks = plugin.divide_into_chunks(&result)?;
        if chunks.is_empty() {
            return Ok((result.full_type, 0));
        }

        let source_id = result.id.clone().unwrap_or_else(|| {
            datasource_id
                .datasource_path()
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string()
        });

        let datasource_run = DatasourceRun::create(
            &self.db,
            NewDatasourceRun {
                run_id,
                plugin: plugin.name(),
                full_type: &result.full_type,
                source_id: &source_id,
                datasource_id: &datasource_id.to_string(),
                storage_directory: &run_dir.to_string_lossy(),
            },
        )
        .await?;

        let written = self
            .embedding_service
            .embed_chunks(datasource_run.datasource_run_id, &chunks, content)
            .await?;

        Ok((result.full_type, written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildOptions, BuildOrchestrator};
    use crate::embedding_service::ChunkEmbeddingMode;
    use crate::plugins::default_plugin_registry;
    use async_trait::async_trait;
    use common::config::AppConfig;
    use common::llm::embedding::EmbeddingProvider;
    use common::storage::types::chunk::Chunk;
    use std::path::Path;
    use uuid::Uuid;

    struct StubEmbeddingProvider;

    #[async_trait]
    impl EmbeddingProvider for StubEmbeddingProvider {
        fn embedder(&self) -> &str {
            "tests"
        }

        fn model_id(&self) -> &str {
            "model:v1"
        }

        fn dim(&self) -> usize {
            4
        }

        async fn embed(&self, input: &str) -> Result<Vec<f32>, EngineError> {
            let x = input.len() as f32;
            Ok(vec![x, x + 1.0, x + 2.0, x + 3.0])
        }
    }

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, content).expect("write");
    }

    #[tokio::test]
    async fn indexes_contexts_written_by_an_unindexed_build() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = ProjectLayout::new(dir.path());
        layout.ensure_created().expect("layout");
        write(&layout.src_dir.join("files/notes.txt"), "users table notes");

        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("index_ns", &database)
                .await
                .expect("in-memory db"),
        );
        db.ensure_initialized().await.expect("init");

        let config = AppConfig {
            project_dir: ".".into(),
            openai_api_key: String::new(),
            openai_base_url: String::new(),
            embedder: "tests".into(),
            embedding_model: "model:v1".into(),
            embedding_dimensions: 4,
            chat_model: "c".into(),
            file_chunk_size: 1000,
        };
        let registry = Arc::new(default_plugin_registry(&config));

        // Build context documents without generating embeddings.
        let orchestrator = BuildOrchestrator::new(
            Arc::clone(&db),
            layout.clone(),
            Arc::clone(&registry),
            ChunkEmbeddingService::new(
                Arc::clone(&db),
                Arc::new(StubEmbeddingProvider),
                None,
                ChunkEmbeddingMode::EmbeddableTextOnly,
            ),
        );
        let build = orchestrator
            .build(BuildOptions {
                datasource_ids: None,
                generate_embeddings: false,
            })
            .await
            .expect("build");
        assert_eq!(build.status, RunStatus::Success);

        // Index the built contexts after the fact.
        let indexer = ContextIndexer::new(
            Arc::clone(&db),
            layout.clone(),
            Arc::clone(&registry),
            ChunkEmbeddingService::new(
                Arc::clone(&db),
                Arc::new(StubEmbeddingProvider),
                None,
                ChunkEmbeddingMode::EmbeddableTextOnly,
            ),
        );
        let summary = indexer.index_built_contexts(None).await.expect("index");

        assert_eq!(summary.outcomes.len(), 1);
        let outcome = &summary.outcomes[0];
        assert!(outcome.error.is_none());
        assert_eq!(outcome.full_type, "files/txt");
        assert!(outcome.chunk_count > 0);

        let datasource_runs = DatasourceRun::list_for_run(&db, summary.run_id)
            .await
            .expect("list");
        assert_eq!(datasource_runs.len(), 1);
        let count = Chunk::count_for_datasource_run(&db, datasource_runs[0].datasource_run_id)
            .await
            .expect("count");
        assert_eq!(count as usize, outcome.chunk_count);
    }

    #[tokio::test]
    async fn indexing_without_built_contexts_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = ProjectLayout::new(dir.path());
        layout.ensure_created().expect("layout");

        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("index_ns", &database)
                .await
                .expect("in-memory db"),
        );
        db.ensure_initialized().await.expect("init");

        let config = AppConfig {
            project_dir: ".".into(),
            openai_api_key: String::new(),
            openai_base_url: String::new(),
            embedder: "tests".into(),
            embedding_model: "model:v1".into(),
            embedding_dimensions: 4,
            chat_model: "c".into(),
            file_chunk_size: 1000,
        };
        let registry = Arc::new(default_plugin_registry(&config));
        let indexer = ContextIndexer::new(
            Arc::clone(&db),
            layout.clone(),
            registry,
            ChunkEmbeddingService::new(
                Arc::clone(&db),
                Arc::new(StubEmbeddingProvider),
                None,
                ChunkEmbeddingMode::EmbeddableTextOnly,
            ),
        );

        let err = indexer.index_built_contexts(None).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
