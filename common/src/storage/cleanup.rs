use tracing::info;

use crate::error::EngineError;
use crate::storage::db::SurrealDbClient;
use crate::storage::shard::{ShardRegistryEntry, EMBEDDING_REGISTRY_TABLE};
use crate::storage::types::chunk::CHUNK_TABLE;

/// Delete every chunk belonging to a datasource, together with its vectors
/// in every registered shard. One transaction; the keyword index entries
/// revert with the chunk rows.
///
/// This is the explicit cleanup path; nothing on the build or search path
/// deletes chunks.
pub async fn delete_datasource_chunks(
    db: &SurrealDbClient,
    datasource_id: &str,
) -> Result<u64, EngineError> {
    let mut response = db
        .query("SELECT VALUE chunk_id FROM type::table($table) WHERE datasource_id = $id;")
        .bind(("table", CHUNK_TABLE))
        .bind(("id", datasource_id.to_owned()))
        .await?;
    let chunk_ids: Vec<i64> = response.take(0)?;

    if chunk_ids.is_empty() {
        return Ok(0);
    }

    let mut registry_response = db
        .query("SELECT * FROM type::table($table);")
        .bind(("table", EMBEDDING_REGISTRY_TABLE))
        .await?;
    let shards: Vec<ShardRegistryEntry> = registry_response.take(0)?;

    let mut request = db
        .query("BEGIN TRANSACTION;")
        .bind(("chunk_ids", chunk_ids.clone()))
        .bind(("datasource_id", datasource_id.to_owned()));

    for (index, shard) in shards.iter().enumerate() {
        request = request
            .query(format!(
                "DELETE FROM type::table($shard_{index}) WHERE chunk_id IN $chunk_ids;"
            ))
            .bind((format!("shard_{index}"), shard.table_name.clone()));
    }

    let response = request
        .query(format!(
            "DELETE FROM {CHUNK_TABLE} WHERE datasource_id = $datasource_id;"
        ))
        .query("COMMIT TRANSACTION;")
        .await?;
    response.check()?;

    info!(
        datasource_id = datasource_id,
        chunks = chunk_ids.len(),
        shards = shards.len(),
        "Deleted datasource chunks"
    );

    Ok(chunk_ids.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{ChunkContent, EmbeddableChunk};
    use crate::storage::persistence::{write_chunks_and_embeddings, ChunkEmbedding};
    use crate::storage::shard::ShardResolver;
    use crate::storage::types::chunk::Chunk;
    use crate::storage::types::datasource_run::{DatasourceRun, NewDatasourceRun};
    use crate::storage::types::run::Run;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn seed_datasource(
        db: &Arc<SurrealDbClient>,
        run_id: i64,
        datasource_id: &str,
        table_name: &str,
        texts: &[&str],
    ) {
        let datasource_run = DatasourceRun::create(
            db,
            NewDatasourceRun {
                run_id,
                plugin: "tests",
                full_type: "custom/test",
                source_id: "s",
                datasource_id,
                storage_directory: "/tmp",
            },
        )
        .await
        .expect("datasource run");

        let items: Vec<ChunkEmbedding> = texts
            .iter()
            .map(|text| ChunkEmbedding {
                chunk: EmbeddableChunk::new(*text, ChunkContent::Text((*text).to_string())),
                vec: vec![0.5; 3],
                display_text: (*text).to_string(),
                generated_description: None,
            })
            .collect();

        write_chunks_and_embeddings(db, datasource_run.datasource_run_id, &items, table_name)
            .await
            .expect("write batch");
    }

    #[tokio::test]
    async fn deletes_chunks_and_vectors_for_one_datasource_only() {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("cleanup_ns", &database)
                .await
                .expect("in-memory db"),
        );
        db.ensure_initialized().await.expect("init");

        let run = Run::begin(&db, "proj", "0.1.0").await.expect("run");
        let resolver = ShardResolver::new(Arc::clone(&db));
        let (table_name, _) = resolver
            .resolve("tests", "model:v1", Some(3))
            .await
            .expect("shard");

        seed_datasource(&db, run.run_id, "custom/a.yaml", &table_name, &["a1", "a2"]).await;
        seed_datasource(&db, run.run_id, "custom/b.yaml", &table_name, &["b1"]).await;

        let deleted = delete_datasource_chunks(&db, "custom/a.yaml")
            .await
            .expect("cleanup");
        assert_eq!(deleted, 2);

        assert_eq!(db.count_table_rows("chunk").await.expect("count"), 1);
        assert_eq!(db.count_table_rows(&table_name).await.expect("count"), 1);

        let survivors = Chunk::list_recent(&db, 10).await.expect("list");
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].datasource_id, "custom/b.yaml");
    }

    #[tokio::test]
    async fn deleting_an_unknown_datasource_is_a_noop() {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("cleanup_ns", &database)
                .await
                .expect("in-memory db"),
        );
        db.ensure_initialized().await.expect("init");

        let deleted = delete_datasource_chunks(&db, "custom/none.yaml")
            .await
            .expect("cleanup");
        assert_eq!(deleted, 0);
    }
}
