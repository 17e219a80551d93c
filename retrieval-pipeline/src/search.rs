use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use common::datasource::DatasourceId;
use common::error::EngineError;
use common::storage::db::SurrealDbClient;
use common::storage::types::chunk::CHUNK_TABLE;

pub const DISTANCE_THRESHOLD: f64 = 0.75;
pub const RRF_K: f64 = 60.0;
pub const CANDIDATE_MULTIPLIER: usize = 3;
const KNN_EF: usize = 100;

#[derive(Debug, Clone)]
pub struct VectorSearchCandidate {
    pub chunk_id: i64,
    pub display_text: String,
    pub embeddable_text: String,
    pub cosine_distance: f64,
    pub full_type: String,
    pub datasource_id: DatasourceId,
}

#[derive(Debug, Clone)]
pub struct Bm25SearchCandidate {
    pub chunk_id: i64,
    pub display_text: String,
    pub embeddable_text: String,
    pub bm25_score: f64,
    pub full_type: String,
    pub datasource_id: DatasourceId,
}

/// How a result was scored; the variant matches the search mode.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchScore {
    Vector {
        vector_distance: f64,
    },
    Keyword {
        bm25_score: f64,
    },
    Rrf {
        vector_distance: Option<f64>,
        bm25_score: Option<f64>,
        rrf_score: f64,
    },
}

impl SearchScore {
    pub fn score(&self) -> f64 {
        match self {
            Self::Vector { vector_distance } => *vector_distance,
            Self::Keyword { bm25_score } => *bm25_score,
            Self::Rrf { rrf_score, .. } => *rrf_score,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk_id: i64,
    pub display_text: String,
    pub embeddable_text: String,
    pub full_type: String,
    pub datasource_id: DatasourceId,
    pub score: SearchScore,
}

#[derive(Debug, Deserialize)]
struct CandidateRow {
    chunk_id: i64,
    display_text: String,
    embeddable_text: String,
    full_type: String,
    datasource_id: String,
    #[serde(default)]
    cosine_distance: Option<f64>,
    #[serde(default)]
    bm25_score: Option<f64>,
}

/// Keyword, vector and RRF-hybrid retrieval over the chunk store.
#[derive(Clone)]
pub struct ChunkSearchRepository {
    db: Arc<SurrealDbClient>,
}

impl ChunkSearchRepository {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    /// BM25 search over the chunk keyword index.
    pub async fn search_chunks_by_keyword_relevance(
        &self,
        query_text: &str,
        limit: usize,
        datasource_ids: Option<&[DatasourceId]>,
    ) -> Result<Vec<SearchResult>, EngineError> {
        let candidates = self
            .get_bm25_candidates(query_text, limit, datasource_ids)
            .await?;

        Ok(candidates
            .into_iter()
            .map(|candidate| SearchResult {
                chunk_id: candidate.chunk_id,
                display_text: candidate.display_text,
                embeddable_text: candidate.embeddable_text,
                full_type: candidate.full_type,
                datasource_id: candidate.datasource_id,
                score: SearchScore::Keyword {
                    bm25_score: candidate.bm25_score,
                },
            })
            .collect())
    }

    /// Cosine similarity search against one embedding shard.
    pub async fn search_chunks_by_vector_similarity(
        &self,
        table_name: &str,
        retrieve_vec: &[f32],
        limit: usize,
        datasource_ids: Option<&[DatasourceId]>,
    ) -> Result<Vec<SearchResult>, EngineError> {
        let candidates = self
            .get_vector_candidates(table_name, retrieve_vec, limit, datasource_ids)
            .await?;

        Ok(candidates
            .into_iter()
            .map(|candidate| SearchResult {
                chunk_id: candidate.chunk_id,
                display_text: candidate.display_text,
                embeddable_text: candidate.embeddable_text,
                full_type: candidate.full_type,
                datasource_id: candidate.datasource_id,
                score: SearchScore::Vector {
                    vector_distance: candidate.cosine_distance,
                },
            })
            .collect())
    }

    /// Hybrid retrieval: vector and BM25 candidate lists fused with
    /// Reciprocal Rank Fusion.
    pub async fn search_chunks_with_hybrid_search(
        &self,
        table_name: &str,
        retrieve_vec: &[f32],
        query_text: &str,
        limit: usize,
        datasource_ids: Option<&[DatasourceId]>,
    ) -> Result<Vec<SearchResult>, EngineError> {
        let candidate_limit = limit.max(limit.saturating_mul(CANDIDATE_MULTIPLIER));

        let vector_candidates = self
            .get_vector_candidates(table_name, retrieve_vec, candidate_limit, datasource_ids)
            .await?;
        let bm25_candidates = self
            .get_bm25_candidates(query_text, candidate_limit, datasource_ids)
            .await?;

        Ok(fuse_by_rrf(&vector_candidates, &bm25_candidates, limit))
    }

    async fn get_vector_candidates(
        &self,
        table_name: &str,
        retrieve_vec: &[f32],
        limit: usize,
        datasource_ids: Option<&[DatasourceId]>,
    ) -> Result<Vec<VectorSearchCandidate>, EngineError> {
        let filter = if datasource_ids.is_some() {
            " AND chunk.datasource_id IN $datasource_ids"
        } else {
            ""
        };

        let sql = format!(
            "SELECT \
                chunk_id, \
                chunk.embeddable_text AS embeddable_text, \
                chunk.display_text AS display_text, \
                chunk.full_type AS full_type, \
                chunk.datasource_id AS datasource_id, \
                (1 - vector::similarity::cosine(vec, $vec)) AS cosine_distance \
             FROM type::table($shard_table) \
             WHERE vec <|{limit},{KNN_EF}|> $vec{filter} \
             ORDER BY cosine_distance ASC;"
        );

        let mut query = self
            .db
            .query(sql)
            .bind(("shard_table", table_name.to_owned()))
            .bind(("vec", retrieve_vec.to_vec()));
        if let Some(ids) = datasource_ids {
            let values: Vec<String> = ids.iter().map(ToString::to_string).collect();
            query = query.bind(("datasource_ids", values));
        }

        let mut response = query.await?;
        let rows: Vec<CandidateRow> = response.take(0)?;

        debug!(
            table = table_name,
            candidates = rows.len(),
            "Vector candidates fetched"
        );

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(cosine_distance) = row.cosine_distance else {
                continue;
            };
            if cosine_distance >= DISTANCE_THRESHOLD {
                continue;
            }
            candidates.push(VectorSearchCandidate {
                chunk_id: row.chunk_id,
                display_text: row.display_text,
                embeddable_text: row.embeddable_text,
                cosine_distance,
                full_type: row.full_type,
                datasource_id: DatasourceId::from_string_repr(&row.datasource_id)?,
            });
        }

        // Ascending distance, later-inserted chunk first on ties.
        candidates.sort_by(|a, b| {
            a.cosine_distance
                .partial_cmp(&b.cosine_distance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.chunk_id.cmp(&a.chunk_id))
        });
        candidates.truncate(limit);

        Ok(candidates)
    }

    async fn get_bm25_candidates(
        &self,
        query_text: &str,
        limit: usize,
        datasource_ids: Option<&[DatasourceId]>,
    ) -> Result<Vec<Bm25SearchCandidate>, EngineError> {
        let filter = if datasource_ids.is_some() {
            " AND datasource_id IN $datasource_ids"
        } else {
            ""
        };

        let sql = format!(
            "SELECT \
                chunk_id, \
                embeddable_text, \
                display_text, \
                full_type, \
                datasource_id, \
                IF search::score(0) != NONE THEN search::score(0) ELSE 0 END AS bm25_score \
             FROM {CHUNK_TABLE} \
             WHERE keyword_index_text @0@ $terms{filter} \
             ORDER BY bm25_score DESC \
             LIMIT $limit;"
        );

        let mut query = self
            .db
            .query(sql)
            .bind(("terms", query_text.to_owned()))
            .bind(("limit", limit as i64));
        if let Some(ids) = datasource_ids {
            let values: Vec<String> = ids.iter().map(ToString::to_string).collect();
            query = query.bind(("datasource_ids", values));
        }

        let mut response = query.await?;
        let rows: Vec<CandidateRow> = response.take(0)?;

        debug!(candidates = rows.len(), "BM25 candidates fetched");

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(bm25_score) = row.bm25_score else {
                continue;
            };
            candidates.push(Bm25SearchCandidate {
                chunk_id: row.chunk_id,
                display_text: row.display_text,
                embeddable_text: row.embeddable_text,
                bm25_score,
                full_type: row.full_type,
                datasource_id: DatasourceId::from_string_repr(&row.datasource_id)?,
            });
        }

        // Descending score, later-inserted chunk first on ties.
        candidates.sort_by(|a, b| {
            b.bm25_score
                .partial_cmp(&a.bm25_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.chunk_id.cmp(&a.chunk_id))
        });
        candidates.truncate(limit);

        Ok(candidates)
    }
}

/// Reciprocal Rank Fusion over the two candidate lists: every list
/// contributes `1 / (K + rank)` per chunk. Ties on the fused score break by
/// `chunk_id` descending so equal-scored results stay deterministic.
pub fn fuse_by_rrf(
    vector_candidates: &[VectorSearchCandidate],
    bm25_candidates: &[Bm25SearchCandidate],
    limit: usize,
) -> Vec<SearchResult> {
    let mut scores_by_chunk_id: HashMap<i64, f64> = HashMap::new();

    for (index, candidate) in vector_candidates.iter().enumerate() {
        let rank = (index + 1) as f64;
        *scores_by_chunk_id.entry(candidate.chunk_id).or_insert(0.0) += 1.0 / (RRF_K + rank);
    }
    for (index, candidate) in bm25_candidates.iter().enumerate() {
        let rank = (index + 1) as f64;
        *scores_by_chunk_id.entry(candidate.chunk_id).or_insert(0.0) += 1.0 / (RRF_K + rank);
    }

    let vector_by_chunk_id: HashMap<i64, &VectorSearchCandidate> = vector_candidates
        .iter()
        .map(|candidate| (candidate.chunk_id, candidate))
        .collect();
    let bm25_by_chunk_id: HashMap<i64, &Bm25SearchCandidate> = bm25_candidates
        .iter()
        .map(|candidate| (candidate.chunk_id, candidate))
        .collect();

    let mut ranked: Vec<(i64, f64)> = scores_by_chunk_id.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.0.cmp(&a.0))
    });

    let mut results = Vec::new();
    for (chunk_id, rrf_score) in ranked.into_iter().take(limit) {
        let vector_candidate = vector_by_chunk_id.get(&chunk_id);
        let bm25_candidate = bm25_by_chunk_id.get(&chunk_id);

        let (display_text, embeddable_text, full_type, datasource_id) = match vector_candidate {
            Some(candidate) => (
                candidate.display_text.clone(),
                candidate.embeddable_text.clone(),
                candidate.full_type.clone(),
                candidate.datasource_id.clone(),
            ),
            None => match bm25_candidate {
                Some(candidate) => (
                    candidate.display_text.clone(),
                    candidate.embeddable_text.clone(),
                    candidate.full_type.clone(),
                    candidate.datasource_id.clone(),
                ),
                None => continue,
            },
        };

        results.push(SearchResult {
            chunk_id,
            display_text,
            embeddable_text,
            full_type,
            datasource_id,
            score: SearchScore::Rrf {
                vector_distance: vector_candidate.map(|c| c.cosine_distance),
                bm25_score: bm25_candidate.map(|c| c.bm25_score),
                rrf_score,
            },
        });
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(repr: &str) -> DatasourceId {
        DatasourceId::from_string_repr(repr).expect("id")
    }

    fn vector_candidate(chunk_id: i64, distance: f64) -> VectorSearchCandidate {
        VectorSearchCandidate {
            chunk_id,
            display_text: format!("chunk {chunk_id}"),
            embeddable_text: format!("chunk {chunk_id}"),
            cosine_distance: distance,
            full_type: "custom/config".into(),
            datasource_id: id("custom/a.yaml"),
        }
    }

    fn bm25_candidate(chunk_id: i64, score: f64) -> Bm25SearchCandidate {
        Bm25SearchCandidate {
            chunk_id,
            display_text: format!("chunk {chunk_id}"),
            embeddable_text: format!("chunk {chunk_id}"),
            bm25_score: score,
            full_type: "custom/config".into(),
            datasource_id: id("custom/a.yaml"),
        }
    }

    #[test]
    fn rrf_scores_sum_reciprocal_ranks() {
        // Vector ranks [A=1, B=2]; BM25 ranks [B=1, A=2].
        let vector = vec![vector_candidate(1, 0.1), vector_candidate(2, 0.2)];
        let bm25 = vec![bm25_candidate(2, 9.0), bm25_candidate(1, 5.0)];

        let results = fuse_by_rrf(&vector, &bm25, 10);
        assert_eq!(results.len(), 2);

        let expected = 1.0 / 61.0 + 1.0 / 62.0;
        for result in &results {
            let SearchScore::Rrf {
                rrf_score,
                vector_distance,
                bm25_score,
            } = &result.score
            else {
                panic!("expected an RRF score");
            };
            assert!((rrf_score - expected).abs() < 1e-12);
            assert!(vector_distance.is_some());
            assert!(bm25_score.is_some());
        }

        // Equal fused scores break by chunk_id descending.
        assert_eq!(results[0].chunk_id, 2);
        assert_eq!(results[1].chunk_id, 1);
    }

    #[test]
    fn rrf_prefers_vector_candidate_data_and_falls_back_to_bm25() {
        let vector = vec![vector_candidate(1, 0.1)];
        let mut only_bm25 = bm25_candidate(2, 3.0);
        only_bm25.display_text = "bm25 only".into();
        let bm25 = vec![only_bm25];

        let results = fuse_by_rrf(&vector, &bm25, 10);
        assert_eq!(results.len(), 2);

        let first = results.iter().find(|r| r.chunk_id == 1).expect("chunk 1");
        assert_eq!(first.display_text, "chunk 1");
        let second = results.iter().find(|r| r.chunk_id == 2).expect("chunk 2");
        assert_eq!(second.display_text, "bm25 only");

        let SearchScore::Rrf {
            vector_distance,
            bm25_score,
            ..
        } = &second.score
        else {
            panic!("expected an RRF score");
        };
        assert!(vector_distance.is_none());
        assert_eq!(*bm25_score, Some(3.0));
    }

    #[test]
    fn rrf_respects_the_result_limit() {
        let vector: Vec<_> = (1..=5).map(|i| vector_candidate(i, 0.01 * i as f64)).collect();
        let results = fuse_by_rrf(&vector, &[], 2);
        assert_eq!(results.len(), 2);
        // Highest RRF score is the best vector rank.
        assert_eq!(results[0].chunk_id, 1);
    }
}
