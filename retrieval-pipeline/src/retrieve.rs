use std::sync::Arc;

use tracing::debug;

use common::datasource::DatasourceId;
use common::error::EngineError;
use common::llm::embedding::EmbeddingProvider;
use common::llm::prompt::PromptProvider;
use common::storage::db::SurrealDbClient;
use common::storage::shard::ShardResolver;

use crate::search::{ChunkSearchRepository, SearchResult};

pub const DEFAULT_LIMIT: usize = 10;

/// How the query text is turned into an embeddable query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RagMode {
    #[default]
    RawQuery,
    QueryWithInstruction,
    RewriteQuery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    #[default]
    HybridSearch,
    KeywordSearch,
    VectorSearch,
}

const INSTRUCTION_TASK: &str = "Generate an embedding aware of the named entities such as to \
be useful for a semantic search on database table and column names";

const REWRITE_PROMPT_HEADER: &str = r#"You are an AI language model assistant.
Your task is to use NLP (Natural Language Processing) and NER (Named Entity Recognition) to extract named entities from a given question.
Those entities will be used as metadata in a semantic search.
Do not try to answer the question or get more information about the entities you find.

Output each entity separated by a newline in the following format, without any other explanations:
"extracted entity": "entity classification or tag"

Examples:
1. From the question "Where did Apple CEO Tim Cook announced the latest iPhone models last September?", you should respond with:
"Apple": "Organization"
"Tim Cook": "Person"
"iPhone": "Product"
"last September": "Date"

2. From the question "How many accounts in North Bohemia has made a transaction with the partner's bank being AB?", you should respond with:
"North Bohemia": "Location"
"partner": "Person"
"AB": "Organization"

3. From the question "List out top 10 Spanish drivers who were born before 1982 and have the latest lap time.", you should respond with:
"Spanish": "NORP (Nationalities, Religious, or Political groups)"
"1982": "Date"

Here is the question:
"#;

/// Answers retrieval queries with keyword, vector or hybrid search, with
/// optional query rewriting through the prompt provider.
///
/// Stateless and re-entrant; safe to share across concurrent queries.
pub struct RetrieveService {
    repository: ChunkSearchRepository,
    resolver: ShardResolver,
    provider: Arc<dyn EmbeddingProvider>,
    prompts: Option<Arc<dyn PromptProvider>>,
}

impl RetrieveService {
    pub fn new(
        db: Arc<SurrealDbClient>,
        provider: Arc<dyn EmbeddingProvider>,
        prompts: Option<Arc<dyn PromptProvider>>,
    ) -> Self {
        Self {
            repository: ChunkSearchRepository::new(Arc::clone(&db)),
            resolver: ShardResolver::new(db),
            provider,
            prompts,
        }
    }

    pub async fn retrieve(
        &self,
        text: &str,
        limit: Option<usize>,
        datasource_ids: Option<&[DatasourceId]>,
        rag_mode: RagMode,
        search_mode: SearchMode,
    ) -> Result<Vec<SearchResult>, EngineError> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT);
        if limit < 1 {
            return Err(EngineError::Validation("limit must be at least 1".into()));
        }

        let results = self
            .do_retrieve(text, limit, datasource_ids, rag_mode, search_mode)
            .await?;

        debug!(results = results.len(), "Retrieved display texts");

        Ok(results)
    }

    async fn do_retrieve(
        &self,
        text: &str,
        limit: usize,
        datasource_ids: Option<&[DatasourceId]>,
        rag_mode: RagMode,
        search_mode: SearchMode,
    ) -> Result<Vec<SearchResult>, EngineError> {
        if search_mode == SearchMode::KeywordSearch {
            return self
                .repository
                .search_chunks_by_keyword_relevance(text, limit, datasource_ids)
                .await;
        }

        // Vector and hybrid modes need the shard for the configured pair;
        // nothing indexed for it is an error, not an empty result.
        let (table_name, _dim) = self
            .resolver
            .resolve(self.provider.embedder(), self.provider.model_id(), None)
            .await?;

        let embeddable_query = match rag_mode {
            RagMode::RawQuery => text.to_string(),
            RagMode::QueryWithInstruction => {
                format!("Instruct: {INSTRUCTION_TASK}\nQuery:{text}")
            }
            RagMode::RewriteQuery => self.rewrite_retrieve_query(text).await?,
        };

        let retrieve_vec = self.provider.embed(&embeddable_query).await?;

        match search_mode {
            SearchMode::VectorSearch => {
                self.repository
                    .search_chunks_by_vector_similarity(
                        &table_name,
                        &retrieve_vec,
                        limit,
                        datasource_ids,
                    )
                    .await
            }
            SearchMode::HybridSearch => {
                self.repository
                    .search_chunks_with_hybrid_search(
                        &table_name,
                        &retrieve_vec,
                        text,
                        limit,
                        datasource_ids,
                    )
                    .await
            }
            SearchMode::KeywordSearch => unreachable!("handled above"),
        }
    }

    /// Extract named entities from the question and append them to the
    /// query. Any prompt failure degrades to the raw query; a provider
    /// outage must never make search itself fail.
    async fn rewrite_retrieve_query(&self, text: &str) -> Result<String, EngineError> {
        let Some(prompts) = &self.prompts else {
            return Err(EngineError::Validation(
                "rewrite query mode requires a prompt provider".into(),
            ));
        };

        let prompt = format!("{REWRITE_PROMPT_HEADER}{text}\n");
        match prompts.prompt(&prompt).await {
            Ok(extracted_named_entities) => Ok(format!("{text}\n{extracted_named_entities}")),
            Err(err) => {
                debug!(error = %err, "Failed to prompt rewritten query; using the raw query");
                Ok(text.to_string())
            }
        }
    }
}
