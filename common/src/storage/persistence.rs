use chrono::Utc;
use serde::Serialize;
use surrealdb::RecordId;
use tracing::debug;

use crate::error::EngineError;
use crate::plugin::EmbeddableChunk;
use crate::storage::db::SurrealDbClient;
use crate::storage::sequence::Sequence;
use crate::storage::shard::{ShardRegistryEntry, EMBEDDING_REGISTRY_TABLE};
use crate::storage::types::chunk::{Chunk, CHUNK_TABLE};
use crate::storage::types::datasource_run::DatasourceRun;

/// One (chunk, vector) pair ready for persistence.
#[derive(Debug, Clone)]
pub struct ChunkEmbedding {
    pub chunk: EmbeddableChunk,
    pub vec: Vec<f32>,
    pub display_text: String,
    pub generated_description: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRow {
    chunk_id: i64,
    chunk: RecordId,
    vec: Vec<f32>,
    #[serde(serialize_with = "crate::storage::types::serialize_datetime")]
    created_at: chrono::DateTime<Utc>,
}

const MISSING_DATASOURCE_RUN: &str = "datasource_run missing";

/// Atomically write a batch of (chunk, vector) pairs for one datasource run.
///
/// All rows land in a single transaction: the chunk rows, the vector rows in
/// the shard table, and the keyword index entries either all become visible
/// or none do. Validation failures (empty batch, unknown shard table, wrong
/// vector length) happen before any write; a missing datasource run is an
/// integrity failure.
pub async fn write_chunks_and_embeddings(
    db: &SurrealDbClient,
    datasource_run_id: i64,
    chunk_embeddings: &[ChunkEmbedding],
    table_name: &str,
) -> Result<(), EngineError> {
    if chunk_embeddings.is_empty() {
        return Err(EngineError::Validation(
            "chunk_embeddings must not be empty".into(),
        ));
    }

    let mut registry_response = db
        .query(
            "SELECT * FROM type::table($table) WHERE table_name = $table_name LIMIT 1;",
        )
        .bind(("table", EMBEDDING_REGISTRY_TABLE))
        .bind(("table_name", table_name.to_owned()))
        .await?;
    let registered: Vec<ShardRegistryEntry> = registry_response.take(0)?;
    let shard = registered.into_iter().next().ok_or_else(|| {
        EngineError::Validation(format!(
            "'{table_name}' is not a registered embedding shard table"
        ))
    })?;

    for (index, item) in chunk_embeddings.iter().enumerate() {
        if item.vec.len() != shard.dim {
            return Err(EngineError::Validation(format!(
                "vector at position {index} has length {}, shard '{table_name}' \
                 requires {}",
                item.vec.len(),
                shard.dim
            )));
        }
    }

    let datasource_run = DatasourceRun::get(db, datasource_run_id)
        .await?
        .ok_or_else(|| {
            EngineError::Integrity(format!(
                "datasource_run {datasource_run_id} does not exist"
            ))
        })?;

    let count = chunk_embeddings.len() as i64;
    let first_id = Sequence::reserve_block(db, Sequence::CHUNK, count).await?;

    let mut request = db
        .query("BEGIN TRANSACTION;")
        .query(format!(
            "IF record::exists(type::thing('datasource_run', $dsr_id)) == false \
             {{ THROW '{MISSING_DATASOURCE_RUN}' }};"
        ))
        .bind(("dsr_id", datasource_run_id))
        .bind(("shard_table", table_name.to_owned()));

    for (index, item) in chunk_embeddings.iter().enumerate() {
        let chunk_id = first_id + index as i64;
        let now = Utc::now();

        let chunk_row = Chunk {
            chunk_id,
            datasource_run_id,
            datasource_id: datasource_run.datasource_id.clone(),
            full_type: datasource_run.full_type.clone(),
            embeddable_text: item.chunk.embeddable_text.clone(),
            display_text: item.display_text.clone(),
            keyword_index_text: item.chunk.embeddable_text.clone(),
            generated_description: item.generated_description.clone(),
            created_at: now,
        };
        let embedding_row = EmbeddingRow {
            chunk_id,
            chunk: RecordId::from_table_key(CHUNK_TABLE, chunk_id),
            vec: item.vec.clone(),
            created_at: now,
        };

        request = request
            .query(format!(
                "CREATE type::thing('{CHUNK_TABLE}', $chunk_id_{index}) CONTENT $chunk_{index};"
            ))
            .query(format!(
                "CREATE type::thing($shard_table, $chunk_id_{index}) CONTENT $emb_{index};"
            ))
            .bind((format!("chunk_id_{index}"), chunk_id))
            .bind((format!("chunk_{index}"), chunk_row))
            .bind((format!("emb_{index}"), embedding_row));
    }

    let response = request.query("COMMIT TRANSACTION;").await?;

    response.check().map_err(|err| {
        if err.to_string().contains(MISSING_DATASOURCE_RUN) {
            EngineError::Integrity(format!(
                "datasource_run {datasource_run_id} does not exist"
            ))
        } else {
            EngineError::Database(err)
        }
    })?;

    debug!(
        datasource_run_id = datasource_run_id,
        chunks = chunk_embeddings.len(),
        table = table_name,
        "Persisted chunk batch"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::ChunkContent;
    use crate::storage::shard::ShardResolver;
    use crate::storage::types::datasource_run::NewDatasourceRun;
    use crate::storage::types::run::Run;
    use std::sync::Arc;
    use uuid::Uuid;

    struct Fixture {
        db: Arc<SurrealDbClient>,
        datasource_run_id: i64,
        table_name: String,
    }

    async fn fixture(dim: usize) -> Fixture {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("persistence_ns", &database)
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
                source_id: "src-1",
                datasource_id: "custom/test.yaml",
                storage_directory: "/tmp",
            },
        )
        .await
        .expect("datasource run");

        let resolver = ShardResolver::new(Arc::clone(&db));
        let (table_name, _) = resolver
            .resolve("tests", "model:v1", Some(dim))
            .await
            .expect("shard");

        Fixture {
            db,
            datasource_run_id: datasource_run.datasource_run_id,
            table_name,
        }
    }

    fn item(text: &str, fill: f32, dim: usize) -> ChunkEmbedding {
        ChunkEmbedding {
            chunk: EmbeddableChunk::new(text, ChunkContent::Text(text.to_string())),
            vec: vec![fill; dim],
            display_text: text.to_string(),
            generated_description: None,
        }
    }

    #[tokio::test]
    async fn successful_batch_writes_all_pairs_in_order() {
        let f = fixture(3).await;
        let items = vec![item("A", 0.0, 3), item("B", 1.0, 3), item("C", 2.0, 3)];

        write_chunks_and_embeddings(&f.db, f.datasource_run_id, &items, &f.table_name)
            .await
            .expect("write batch");

        let chunk_count = Chunk::count_for_datasource_run(&f.db, f.datasource_run_id)
            .await
            .expect("count");
        assert_eq!(chunk_count, 3);
        assert_eq!(
            f.db.count_table_rows(&f.table_name).await.expect("count"),
            3
        );

        // Persisted in input order, with monotonic chunk ids.
        let recent = Chunk::list_recent(&f.db, 10).await.expect("list");
        let texts: Vec<&str> = recent.iter().map(|c| c.embeddable_text.as_str()).collect();
        assert_eq!(texts, vec!["C", "B", "A"]);
        assert_eq!(recent[0].datasource_id, "custom/test.yaml");
        assert_eq!(recent[0].keyword_index_text, "C");
    }

    #[tokio::test]
    async fn empty_batch_is_rejected_without_writing() {
        let f = fixture(3).await;

        let err = write_chunks_and_embeddings(&f.db, f.datasource_run_id, &[], &f.table_name)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(
            Chunk::count_for_datasource_run(&f.db, f.datasource_run_id)
                .await
                .expect("count"),
            0
        );
    }

    #[tokio::test]
    async fn unknown_shard_table_is_rejected_without_writing() {
        let f = fixture(3).await;
        let items = vec![item("A", 0.0, 3)];

        let err = write_chunks_and_embeddings(
            &f.db,
            f.datasource_run_id,
            &items,
            "embeddings__nope__nope__3",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(
            Chunk::count_for_datasource_run(&f.db, f.datasource_run_id)
                .await
                .expect("count"),
            0
        );
    }

    #[tokio::test]
    async fn wrong_vector_length_fails_before_any_write() {
        let f = fixture(768).await;
        let items = vec![item("ok", 0.0, 768), item("short", 0.0, 384)];

        let err =
            write_chunks_and_embeddings(&f.db, f.datasource_run_id, &items, &f.table_name)
                .await
                .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(
            Chunk::count_for_datasource_run(&f.db, f.datasource_run_id)
                .await
                .expect("count"),
            0
        );
        assert_eq!(
            f.db.count_table_rows(&f.table_name).await.expect("count"),
            0
        );
    }

    #[tokio::test]
    async fn missing_datasource_run_is_an_integrity_failure() {
        let f = fixture(3).await;
        let items = vec![item("A", 0.0, 3)];

        let err = write_chunks_and_embeddings(&f.db, 9_999_999, &items, &f.table_name)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Integrity(_)));
        assert_eq!(
            f.db.count_table_rows(&f.table_name).await.expect("count"),
            0
        );
    }

    #[tokio::test]
    async fn mid_batch_failure_rolls_back_the_whole_batch() {
        let f = fixture(3).await;

        // Occupy a chunk id the next batch will try to claim, so its second
        // CREATE fails mid-transaction.
        let first = vec![item("seed", 0.0, 3)];
        write_chunks_and_embeddings(&f.db, f.datasource_run_id, &first, &f.table_name)
            .await
            .expect("seed write");

        f.db.query("CREATE type::thing('chunk', 3) CONTENT { chunk_id: 3 };")
            .await
            .expect("occupy id")
            .check()
            .expect("occupy id check");

        let batch = vec![item("X", 0.0, 3), item("Y", 1.0, 3), item("Z", 2.0, 3)];
        let err =
            write_chunks_and_embeddings(&f.db, f.datasource_run_id, &batch, &f.table_name)
                .await
                .unwrap_err();
        assert!(matches!(err, EngineError::Database(_)));

        // Only the seed chunk survived; nothing from the failed batch did.
        assert_eq!(
            Chunk::count_for_datasource_run(&f.db, f.datasource_run_id)
                .await
                .expect("count"),
            1
        );
        assert_eq!(
            f.db.count_table_rows(&f.table_name).await.expect("count"),
            1
        );
        assert!(Chunk::get(&f.db, 2).await.expect("get").is_none());
    }
}
