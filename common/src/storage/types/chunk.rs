use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::storage::db::SurrealDbClient;

use super::{deserialize_datetime, serialize_datetime};

pub const CHUNK_TABLE: &str = "chunk";

/// One indexed unit of searchable text.
///
/// `datasource_id` and `full_type` are denormalized from the owning
/// `datasource_run` so both search paths can filter and label results in a
/// single query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: i64,
    pub datasource_run_id: i64,
    pub datasource_id: String,
    pub full_type: String,
    /// Text handed to the embedder.
    pub embeddable_text: String,
    /// Text surfaced to callers; may equal `embeddable_text`.
    pub display_text: String,
    /// Text fed to the BM25 index; equal to `embeddable_text` today.
    pub keyword_index_text: String,
    pub generated_description: Option<String>,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime",
        default
    )]
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    pub async fn get(db: &SurrealDbClient, chunk_id: i64) -> Result<Option<Self>, EngineError> {
        Ok(db
            .select(surrealdb::RecordId::from_table_key(CHUNK_TABLE, chunk_id))
            .await?)
    }

    pub async fn count_for_datasource_run(
        db: &SurrealDbClient,
        datasource_run_id: i64,
    ) -> Result<u64, EngineError> {
        #[derive(Deserialize)]
        struct CountRow {
            count: u64,
        }

        let mut response = db
            .query(
                "SELECT count() AS count FROM type::table($table) \
                 WHERE datasource_run_id = $id GROUP ALL;",
            )
            .bind(("table", CHUNK_TABLE))
            .bind(("id", datasource_run_id))
            .await?;
        let rows: Vec<CountRow> = response.take(0)?;
        Ok(rows.first().map_or(0, |r| r.count))
    }

    /// Most recent chunks first; the default listing order.
    pub async fn list_recent(db: &SurrealDbClient, limit: usize) -> Result<Vec<Self>, EngineError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table) \
                 ORDER BY chunk_id DESC LIMIT $limit;",
            )
            .bind(("table", CHUNK_TABLE))
            .bind(("limit", limit as i64))
            .await?;
        Ok(response.take(0)?)
    }
}
