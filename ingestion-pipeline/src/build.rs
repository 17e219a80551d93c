use std::path::Path;
use std::sync::Arc;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{info, warn};

use common::datasource::DatasourceId;
use common::error::EngineError;
use common::plugin::PluginRegistry;
use common::project::ProjectLayout;
use common::storage::db::SurrealDbClient;
use common::storage::types::datasource_run::{DatasourceRun, NewDatasourceRun};
use common::storage::types::run::{Run, RunStatus};

use crate::context_file;
use crate::discovery::{self, DiscoveredDatasource};
use crate::embedding_service::ChunkEmbeddingService;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Restrict the build to these datasources; `None` builds everything.
    pub datasource_ids: Option<Vec<DatasourceId>>,
    pub generate_embeddings: bool,
}

#[derive(Debug)]
pub struct BuildDatasourceOutcome {
    pub datasource_id: DatasourceId,
    pub full_type: String,
    pub chunk_count: usize,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct BuildSummary {
    pub run_id: i64,
    pub status: RunStatus,
    pub outcomes: Vec<BuildDatasourceOutcome>,
}

/// Coordinates a full build: one `Run`, every discovered datasource through
/// its plugin, chunks embedded and persisted, context documents written.
///
/// Per-datasource failures never fail the run; they are logged and the loop
/// continues. The run is finalized on every exit path.
pub struct BuildOrchestrator {
    db: Arc<SurrealDbClient>,
    layout: ProjectLayout,
    registry: Arc<PluginRegistry>,
    embedding_service: ChunkEmbeddingService,
}

impl BuildOrchestrator {
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

    pub async fn build(&self, options: BuildOptions) -> Result<BuildSummary, EngineError> {
        let project_id = self
            .layout
            .project_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());

        let run = Run::begin(&self.db, &project_id, ENGINE_VERSION).await?;
        info!(run_id = run.run_id, project = %project_id, "Build started");

        let outcome = self.run_build_loop(run.run_id, &options).await;

        let status = match &outcome {
            Ok(_) => RunStatus::Success,
            Err(_) => RunStatus::Failed,
        };
        Run::finalize(&self.db, run.run_id, status).await?;
        info!(run_id = run.run_id, status = ?status, "Build finished");

        outcome.map(|outcomes| BuildSummary {
            run_id: run.run_id,
            status,
            outcomes,
        })
    }

    async fn run_build_loop(
        &self,
        run_id: i64,
        options: &BuildOptions,
    ) -> Result<Vec<BuildDatasourceOutcome>, EngineError> {
        let mut discovered = discovery::discover_datasources(&self.layout)?;

        if let Some(wanted) = &options.datasource_ids {
            discovered.retain(|datasource| wanted.contains(&datasource.id));
        }

        let run_dir = self.layout.run_output_dir(run_id);
        std::fs::create_dir_all(&run_dir)?;

        let mut outcomes = Vec::new();
        for datasource in discovered {
            let Some(plugin) = self.registry.get(&datasource.full_type) else {
                warn!(
                    datasource_id = %datasource.id,
                    full_type = %datasource.full_type,
                    "No plugin for datasource type; skipping"
                );
                continue;
            };

            let outcome = match self
                .process_datasource(run_id, &run_dir, plugin.as_ref(), &datasource, options)
                .await
            {
                Ok(chunk_count) => BuildDatasourceOutcome {
                    datasource_id: datasource.id.clone(),
                    full_type: datasource.full_type.clone(),
                    chunk_count,
                    error: None,
                },
                Err(err) => {
                    warn!(
                        datasource_id = %datasource.id,
                        error = %err,
                        "Datasource build failed; continuing with the next one"
                    );
                    BuildDatasourceOutcome {
                        datasource_id: datasource.id.clone(),
                        full_type: datasource.full_type.clone(),
                        chunk_count: 0,
                        error: Some(err.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    async fn process_datasource(
        &self,
        run_id: i64,
        run_dir: &Path,
        plugin: &dyn common::plugin::BuildPlugin,
        datasource: &DiscoveredDatasource,
        options: &BuildOptions,
    ) -> Result<usize, EngineError> {
        let result = plugin
            .execute(&datasource.full_type, &datasource.name, &datasource.config)
            .await?;

        let context_path = context_file::write_context_document(run_dir, &datasource.id, &result)?;
        let rendered_context = context_file::render_context_document(&result)?;

        let chunks = plugin.divide_into_chunks(&result)?;
        if chunks.is_empty() {
            info!(
                datasource_id = %datasource.id,
                "Datasource produced no chunks; context written, nothing to index"
            );
            return Ok(0);
        }

        let source_id = result.id.clone().unwrap_or_else(|| {
            datasource
                .id
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
                full_type: &datasource.full_type,
                source_id: &source_id,
                datasource_id: &datasource.id.to_string(),
                storage_directory: &context_path
                    .parent()
                    .unwrap_or(run_dir)
                    .to_string_lossy(),
            },
        )
        .await?;

        if options.generate_embeddings {
            // Transient provider failures (timeouts, dropped connections) are
            // worth a few backed-off attempts; everything else propagates.
            let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
            RetryIf::spawn(
                retry_strategy,
                || {
                    self.embedding_service.embed_chunks(
                        datasource_run.datasource_run_id,
                        &chunks,
                        &rendered_context,
                    )
                },
                EngineError::is_transient,
            )
            .await?;
        }

        Ok(chunks.len())
    }
}
