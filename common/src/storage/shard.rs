use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;
use crate::storage::db::SurrealDbClient;

use super::types::{deserialize_datetime, serialize_datetime};

pub const EMBEDDING_REGISTRY_TABLE: &str = "embedding_registry";
pub const SHARD_TABLE_PREFIX: &str = "embeddings";

/// One registered vector shard: the table holding vectors for a single
/// (embedder, model) pair, and the dimension every vector in it must have.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRegistryEntry {
    pub embedder: String,
    pub model_id: String,
    pub table_name: String,
    pub dim: usize,
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime",
        default
    )]
    pub created_at: DateTime<Utc>,
}

/// Deterministic shard table name for an (embedder, model, dim) triple.
pub fn shard_table_name(embedder: &str, model_id: &str, dim: usize) -> String {
    format!(
        "{SHARD_TABLE_PREFIX}__{}__{}__{dim}",
        sanitize_identifier(embedder),
        sanitize_identifier(model_id)
    )
}

/// Lowercase, replace anything outside `[a-z0-9_]` with `_`, collapse runs.
fn sanitize_identifier(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    let mut last_was_underscore = false;
    for c in part.to_lowercase().chars() {
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            c
        } else {
            '_'
        };
        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(mapped);
    }
    out
}

fn registry_record_key(embedder: &str, model_id: &str) -> String {
    format!(
        "{}__{}",
        sanitize_identifier(embedder),
        sanitize_identifier(model_id)
    )
}

/// Maps (embedder, model_id) to its shard table, creating the registry entry
/// and the shard table itself on first use.
///
/// The registry is the single source of truth for which shard a search or a
/// write should touch. First use is serialized by the uniqueness constraint
/// on (embedder, model_id) plus `IF NOT EXISTS` table and index definitions.
#[derive(Clone)]
pub struct ShardResolver {
    db: Arc<SurrealDbClient>,
}

impl ShardResolver {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    /// Resolve the shard for an (embedder, model) pair.
    ///
    /// With an existing registry entry the stored pair is returned; a
    /// supplied dimension is checked against it. Without an entry the
    /// dimension is required and the shard table, its vector index and the
    /// registry row are created.
    pub async fn resolve(
        &self,
        embedder: &str,
        model_id: &str,
        dim: Option<usize>,
    ) -> Result<(String, usize), EngineError> {
        if let Some(entry) = self.get(embedder, model_id).await? {
            if let Some(requested) = dim {
                if requested != entry.dim {
                    return Err(EngineError::Invariant(format!(
                        "shard for ({embedder}, {model_id}) has dimension {}, \
                         but {requested} was requested",
                        entry.dim
                    )));
                }
            }
            return Ok((entry.table_name, entry.dim));
        }

        let Some(dim) = dim else {
            return Err(EngineError::NotFound(format!(
                "no shard registered for ({embedder}, {model_id})"
            )));
        };

        let table_name = shard_table_name(embedder, model_id, dim);
        self.create_shard_table(&table_name, dim).await?;

        let entry = ShardRegistryEntry {
            embedder: embedder.to_owned(),
            model_id: model_id.to_owned(),
            table_name: table_name.clone(),
            dim,
            created_at: Utc::now(),
        };

        let created = self
            .db
            .query("CREATE type::thing($table, $key) CONTENT $entry;")
            .bind(("table", EMBEDDING_REGISTRY_TABLE))
            .bind(("key", registry_record_key(embedder, model_id)))
            .bind(("entry", entry))
            .await?
            .check();

        if created.is_err() {
            // Another writer won the registration race. Re-read and verify
            // the stored dimension matches what we were asked for.
            let existing = self.get(embedder, model_id).await?.ok_or_else(|| {
                EngineError::Invariant(format!(
                    "registry entry for ({embedder}, {model_id}) vanished during registration"
                ))
            })?;
            if existing.dim != dim {
                return Err(EngineError::Invariant(format!(
                    "shard for ({embedder}, {model_id}) has dimension {}, \
                     but {dim} was requested",
                    existing.dim
                )));
            }
            return Ok((existing.table_name, existing.dim));
        }

        info!(
            embedder = embedder,
            model_id = model_id,
            table = %table_name,
            dim = dim,
            "Registered new embedding shard"
        );

        Ok((table_name, dim))
    }

    pub async fn get(
        &self,
        embedder: &str,
        model_id: &str,
    ) -> Result<Option<ShardRegistryEntry>, EngineError> {
        let mut response = self
            .db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE embedder = $embedder AND model_id = $model_id LIMIT 1;",
            )
            .bind(("table", EMBEDDING_REGISTRY_TABLE))
            .bind(("embedder", embedder.to_owned()))
            .bind(("model_id", model_id.to_owned()))
            .await?;
        let rows: Vec<ShardRegistryEntry> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    /// Look up a registry entry by its shard table name.
    pub async fn get_by_table_name(
        &self,
        table_name: &str,
    ) -> Result<Option<ShardRegistryEntry>, EngineError> {
        let mut response = self
            .db
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE table_name = $table_name LIMIT 1;",
            )
            .bind(("table", EMBEDDING_REGISTRY_TABLE))
            .bind(("table_name", table_name.to_owned()))
            .await?;
        let rows: Vec<ShardRegistryEntry> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn create_shard_table(&self, table_name: &str, dim: usize) -> Result<(), EngineError> {
        self.db
            .query(format!("DEFINE TABLE IF NOT EXISTS {table_name} SCHEMALESS;"))
            .await?
            .check()?;

        self.db
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_{table_name}_vec ON TABLE {table_name} \
                 FIELDS vec HNSW DIMENSION {dim} DIST COSINE TYPE F32 EFC 100 M 8;"
            ))
            .await?
            .check()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn test_resolver() -> ShardResolver {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("shard_ns", &database)
            .await
            .expect("in-memory db");
        db.ensure_initialized().await.expect("init");
        ShardResolver::new(Arc::new(db))
    }

    #[test]
    fn table_name_policy_sanitizes_and_collapses() {
        assert_eq!(
            shard_table_name("ollama", "nomic-embed-text:v1.5", 768),
            "embeddings__ollama__nomic_embed_text_v1_5__768"
        );
        assert_eq!(
            shard_table_name("OpenAI", "text--embedding//3.small", 1536),
            "embeddings__openai__text_embedding_3_small__1536"
        );
    }

    #[tokio::test]
    async fn resolve_creates_entry_once_and_is_idempotent() {
        let resolver = test_resolver().await;

        let (table, dim) = resolver
            .resolve("ollama", "nomic-embed-text:v1.5", Some(768))
            .await
            .expect("first resolve");
        assert_eq!(table, "embeddings__ollama__nomic_embed_text_v1_5__768");
        assert_eq!(dim, 768);

        // Second resolve returns the identical pair without a dim supplied.
        let (again, dim_again) = resolver
            .resolve("ollama", "nomic-embed-text:v1.5", None)
            .await
            .expect("second resolve");
        assert_eq!(again, table);
        assert_eq!(dim_again, dim);
    }

    #[tokio::test]
    async fn resolve_rejects_dimension_mismatch() {
        let resolver = test_resolver().await;

        resolver
            .resolve("tests", "model:v1", Some(768))
            .await
            .expect("register");

        let err = resolver
            .resolve("tests", "model:v1", Some(384))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Invariant(_)));
    }

    #[tokio::test]
    async fn resolve_without_dim_requires_registration() {
        let resolver = test_resolver().await;

        let err = resolver
            .resolve("tests", "unregistered", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn get_by_table_name_finds_registered_shards() {
        let resolver = test_resolver().await;

        let (table, _) = resolver
            .resolve("tests", "model:v1", Some(8))
            .await
            .expect("register");

        let entry = resolver
            .get_by_table_name(&table)
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(entry.dim, 8);
        assert!(resolver
            .get_by_table_name("embeddings__nope__nope__1")
            .await
            .expect("lookup")
            .is_none());
    }
}
