use crate::error::EngineError;

use super::db::SurrealDbClient;

/// Monotonic id counters, one record per sequence name.
///
/// Reserved ids are never reused: a batch that reserves a block and then
/// fails leaves a gap, which keeps ids strictly increasing in insertion
/// order across the lifetime of the store.
pub struct Sequence;

impl Sequence {
    pub const RUN: &'static str = "run";
    pub const DATASOURCE_RUN: &'static str = "datasource_run";
    pub const CHUNK: &'static str = "chunk";

    pub async fn next_id(db: &SurrealDbClient, name: &str) -> Result<i64, EngineError> {
        Self::advance(db, name, 1).await
    }

    /// Reserve a contiguous block of `count` ids, returning the first one.
    pub async fn reserve_block(
        db: &SurrealDbClient,
        name: &str,
        count: i64,
    ) -> Result<i64, EngineError> {
        if count < 1 {
            return Err(EngineError::Validation(
                "sequence block size must be at least 1".into(),
            ));
        }
        let end = Self::advance(db, name, count).await?;
        Ok(end - count + 1)
    }

    async fn advance(db: &SurrealDbClient, name: &str, count: i64) -> Result<i64, EngineError> {
        let mut response = db
            .query(
                "UPSERT type::thing('sequence', $name) \
                 SET value = (value ?? 0) + $count \
                 RETURN VALUE value;",
            )
            .bind(("name", name.to_owned()))
            .bind(("count", count))
            .await?;

        let values: Vec<i64> = response.take(0)?;
        values.first().copied().ok_or_else(|| {
            EngineError::Invariant(format!("sequence '{name}' returned no value"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn ids_are_monotonic_per_sequence() {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("seq_ns", database)
            .await
            .expect("in-memory db");

        let first = Sequence::next_id(&db, Sequence::CHUNK).await.expect("id");
        let second = Sequence::next_id(&db, Sequence::CHUNK).await.expect("id");
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        // Independent sequences do not interfere.
        let run = Sequence::next_id(&db, Sequence::RUN).await.expect("id");
        assert_eq!(run, 1);
    }

    #[tokio::test]
    async fn reserve_block_returns_contiguous_range() {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("seq_ns", database)
            .await
            .expect("in-memory db");

        let start = Sequence::reserve_block(&db, Sequence::CHUNK, 3)
            .await
            .expect("block");
        assert_eq!(start, 1);

        let next = Sequence::next_id(&db, Sequence::CHUNK).await.expect("id");
        assert_eq!(next, 4);
    }

    #[tokio::test]
    async fn reserve_block_rejects_non_positive_counts() {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("seq_ns", database)
            .await
            .expect("in-memory db");

        let err = Sequence::reserve_block(&db, Sequence::CHUNK, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
