use std::ops::Deref;

use serde::Deserialize;
use surrealdb::{
    engine::any::{connect, Any},
    Error, Surreal,
};
use tracing::warn;

use crate::error::EngineError;

pub const FTS_ANALYZER_NAME: &str = "context_fts_analyzer";
pub const CHUNK_FTS_INDEX_NAME: &str = "chunk_keyword_fts_idx";

/// Client for the embedded store holding runs, chunks and vector shards.
#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    /// Open the store at the given address (e.g. `surrealkv://<project>/state.db`).
    pub async fn open(address: &str, namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect(address).await?;
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Define the analyzer, the chunk keyword index and the registry
    /// uniqueness constraint. Idempotent; called once per store open.
    pub async fn ensure_initialized(&self) -> Result<(), EngineError> {
        self.create_fts_analyzer().await?;

        self.client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS {CHUNK_FTS_INDEX_NAME} ON TABLE chunk \
                 FIELDS keyword_index_text SEARCH ANALYZER {FTS_ANALYZER_NAME} BM25;"
            ))
            .await?
            .check()?;

        self.client
            .query(
                "DEFINE INDEX IF NOT EXISTS embedding_registry_pair_idx \
                 ON TABLE embedding_registry FIELDS embedder, model_id UNIQUE;",
            )
            .await?
            .check()?;

        Ok(())
    }

    /// Prefer snowball stemming; fall back to a lowercase+ascii analyzer when
    /// the filter is unavailable in the running build.
    async fn create_fts_analyzer(&self) -> Result<(), EngineError> {
        let snowball_query = format!(
            "DEFINE ANALYZER IF NOT EXISTS {FTS_ANALYZER_NAME}
                TOKENIZERS class
                FILTERS lowercase, ascii, snowball(english);"
        );

        match self.client.query(snowball_query).await {
            Ok(res) => {
                if res.check().is_ok() {
                    return Ok(());
                }
                warn!(
                    analyzer = FTS_ANALYZER_NAME,
                    "Snowball analyzer check failed; attempting ascii fallback definition"
                );
            }
            Err(err) => {
                warn!(
                    error = %err,
                    "Snowball analyzer creation errored; attempting ascii fallback definition"
                );
            }
        }

        let fallback_query = format!(
            "DEFINE ANALYZER IF NOT EXISTS {FTS_ANALYZER_NAME}
                TOKENIZERS class
                FILTERS lowercase, ascii;"
        );

        self.client.query(fallback_query).await?.check()?;

        Ok(())
    }

    pub async fn count_table_rows(&self, table: &str) -> Result<u64, EngineError> {
        #[derive(Debug, Deserialize)]
        struct CountRow {
            count: u64,
        }

        let query = format!("SELECT count() AS count FROM {table} GROUP ALL;");
        let mut response = self.client.query(query).await?;
        let rows: Vec<CountRow> = response.take(0)?;
        Ok(rows.first().map_or(0, |r| r.count))
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory store for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
