use std::sync::Arc;

use tracing::debug;

use common::error::EngineError;
use common::llm::embedding::EmbeddingProvider;
use common::llm::prompt::DescriptionProvider;
use common::plugin::EmbeddableChunk;
use common::storage::db::SurrealDbClient;
use common::storage::persistence::{self, ChunkEmbedding};
use common::storage::shard::ShardResolver;

/// Whether chunks are embedded as-is or enriched with a generated
/// description first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkEmbeddingMode {
    #[default]
    EmbeddableTextOnly,
    GeneratedDescriptions,
}

/// Turns plugin-produced chunks into persisted (chunk, embedding) rows.
pub struct ChunkEmbeddingService {
    db: Arc<SurrealDbClient>,
    resolver: ShardResolver,
    provider: Arc<dyn EmbeddingProvider>,
    descriptions: Option<DescriptionProvider>,
    mode: ChunkEmbeddingMode,
}

impl ChunkEmbeddingService {
    pub fn new(
        db: Arc<SurrealDbClient>,
        provider: Arc<dyn EmbeddingProvider>,
        descriptions: Option<DescriptionProvider>,
        mode: ChunkEmbeddingMode,
    ) -> Self {
        Self {
            resolver: ShardResolver::new(Arc::clone(&db)),
            db,
            provider,
            descriptions,
            mode,
        }
    }

    /// Embed and persist one datasource run's chunks as a single batch.
    ///
    /// An empty chunk list is a no-op that touches neither the registry nor
    /// any table. A provider failure mid-batch aborts before persistence, so
    /// nothing from the batch becomes visible.
    pub async fn embed_chunks(
        &self,
        datasource_run_id: i64,
        chunks: &[EmbeddableChunk],
        result_context: &str,
    ) -> Result<usize, EngineError> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let (table_name, _dim) = self
            .resolver
            .resolve(
                self.provider.embedder(),
                self.provider.model_id(),
                Some(self.provider.dim()),
            )
            .await?;

        let mut batch = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let vec = self.provider.embed(&chunk.embeddable_text).await?;
            let display_text = chunk.content.render_display();

            let generated_description = match self.mode {
                ChunkEmbeddingMode::EmbeddableTextOnly => None,
                ChunkEmbeddingMode::GeneratedDescriptions => {
                    let descriptions = self.descriptions.as_ref().ok_or_else(|| {
                        EngineError::Validation(
                            "description generation requested without a description provider"
                                .into(),
                        )
                    })?;
                    Some(descriptions.describe(&display_text, result_context).await?)
                }
            };

            batch.push(ChunkEmbedding {
                chunk: chunk.clone(),
                vec,
                display_text,
                generated_description,
            });
        }

        persistence::write_chunks_and_embeddings(
            &self.db,
            datasource_run_id,
            &batch,
            &table_name,
        )
        .await?;

        debug!(
            datasource_run_id = datasource_run_id,
            chunks = batch.len(),
            "Embedded and persisted chunks"
        );

        Ok(batch.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::plugin::ChunkContent;
    use common::storage::types::chunk::Chunk;
    use common::storage::types::datasource_run::{DatasourceRun, NewDatasourceRun};
    use common::storage::types::run::Run;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct StubEmbeddingProvider {
        dim: usize,
        fail_at: Option<usize>,
        calls: AtomicUsize,
    }

    impl StubEmbeddingProvider {
        fn new(dim: usize, fail_at: Option<usize>) -> Self {
            Self {
                dim,
                fail_at,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for StubEmbeddingProvider {
        fn embedder(&self) -> &str {
            "tests"
        }

        fn model_id(&self) -> &str {
            "model:v1"
        }

        fn dim(&self) -> usize {
            self.dim
        }

        async fn embed(&self, _input: &str) -> Result<Vec<f32>, EngineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_at == Some(call) {
                return Err(EngineError::TransientProvider("provider embed failed".into()));
            }
            Ok(vec![call as f32; self.dim])
        }
    }

    struct Fixture {
        db: Arc<SurrealDbClient>,
        datasource_run_id: i64,
    }

    async fn fixture() -> Fixture {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("embed_ns", &database)
                .await
                .expect("in-memory db"),
        );
        db.ensure_initialized().await.expect("init");

        let run = Run::begin(&db, "proj", "0.1.0").await.expect("run");
        let datasource_run = DatasourceRun::create(
            &db,
            NewDatasourceRun {
                run_id: run.run_id,
                plugin: "tests",
                full_type: "custom/test",
                source_id: "s",
                datasource_id: "custom/test.yaml",
                storage_directory: "/tmp",
            },
        )
        .await
        .expect("datasource run");

        Fixture {
            db,
            datasource_run_id: datasource_run.datasource_run_id,
        }
    }

    fn chunks(texts: &[&str]) -> Vec<EmbeddableChunk> {
        texts
            .iter()
            .map(|text| EmbeddableChunk::new(*text, ChunkContent::Text((*text).to_string())))
            .collect()
    }

    #[tokio::test]
    async fn empty_chunks_touch_nothing() {
        let f = fixture().await;
        let provider = Arc::new(StubEmbeddingProvider::new(8, None));
        let service = ChunkEmbeddingService::new(
            Arc::clone(&f.db),
            Arc::clone(&provider) as Arc<dyn EmbeddingProvider>,
            None,
            ChunkEmbeddingMode::EmbeddableTextOnly,
        );

        let written = service
            .embed_chunks(f.datasource_run_id, &[], "")
            .await
            .expect("noop");
        assert_eq!(written, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        // No shard was registered.
        let resolver = ShardResolver::new(Arc::clone(&f.db));
        assert!(resolver
            .get("tests", "model:v1")
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn embeds_resolves_and_persists() {
        let f = fixture().await;
        let provider = Arc::new(StubEmbeddingProvider::new(8, None));
        let service = ChunkEmbeddingService::new(
            Arc::clone(&f.db),
            Arc::clone(&provider) as Arc<dyn EmbeddingProvider>,
            None,
            ChunkEmbeddingMode::EmbeddableTextOnly,
        );

        let written = service
            .embed_chunks(f.datasource_run_id, &chunks(&["A", "B", "C"]), "")
            .await
            .expect("embed");
        assert_eq!(written, 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

        let resolver = ShardResolver::new(Arc::clone(&f.db));
        let entry = resolver
            .get("tests", "model:v1")
            .await
            .expect("lookup")
            .expect("registered");
        assert_eq!(entry.dim, 8);
        assert_eq!(entry.table_name, "embeddings__tests__model_v1__8");

        assert_eq!(
            Chunk::count_for_datasource_run(&f.db, f.datasource_run_id)
                .await
                .expect("count"),
            3
        );
        assert_eq!(
            f.db.count_table_rows(&entry.table_name)
                .await
                .expect("count"),
            3
        );
    }

    #[tokio::test]
    async fn provider_failure_persists_nothing() {
        let f = fixture().await;
        let provider = Arc::new(StubEmbeddingProvider::new(8, Some(1)));
        let service = ChunkEmbeddingService::new(
            Arc::clone(&f.db),
            Arc::clone(&provider) as Arc<dyn EmbeddingProvider>,
            None,
            ChunkEmbeddingMode::EmbeddableTextOnly,
        );

        let err = service
            .embed_chunks(f.datasource_run_id, &chunks(&["X", "Y"]), "")
            .await
            .unwrap_err();
        assert!(err.is_transient());

        assert_eq!(
            Chunk::count_for_datasource_run(&f.db, f.datasource_run_id)
                .await
                .expect("count"),
            0
        );
    }

    #[tokio::test]
    async fn description_mode_without_provider_is_a_validation_error() {
        let f = fixture().await;
        let provider = Arc::new(StubEmbeddingProvider::new(8, None));
        let service = ChunkEmbeddingService::new(
            Arc::clone(&f.db),
            provider as Arc<dyn EmbeddingProvider>,
            None,
            ChunkEmbeddingMode::GeneratedDescriptions,
        );

        let err = service
            .embed_chunks(f.datasource_run_id, &chunks(&["X"]), "ctx")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
