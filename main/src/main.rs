use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use common::config::get_config;
use common::datasource::DatasourceId;
use common::error::EngineError;
use common::llm::embedding::{EmbeddingProvider, OpenAiEmbeddingProvider};
use common::llm::prompt::{DescriptionProvider, OpenAiPromptProvider, PromptProvider};
use common::project::ProjectLayout;
use common::storage::cleanup;
use common::storage::db::SurrealDbClient;

use ingestion_pipeline::build::{BuildOptions, BuildOrchestrator};
use ingestion_pipeline::check::check_datasource_connections;
use ingestion_pipeline::embedding_service::{ChunkEmbeddingMode, ChunkEmbeddingService};
use ingestion_pipeline::index::ContextIndexer;
use ingestion_pipeline::plugins::default_plugin_registry;

use retrieval_pipeline::engine::ContextEngine;
use retrieval_pipeline::{RagMode, RetrieveService, SearchMode};

const STORE_NAMESPACE: &str = "context";
const STORE_DATABASE: &str = "engine";

#[derive(Parser)]
#[command(name = "context-engine", about = "Build and query datasource context indexes")]
struct Cli {
    /// Project directory (defaults to the configured one).
    #[arg(long, global = true)]
    project_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the project skeleton.
    Init,
    /// Build contexts for every configured datasource.
    Build {
        /// Only build these datasource ids.
        #[arg(long = "datasource")]
        datasource_ids: Vec<String>,
        /// Skip embedding generation; only write context documents.
        #[arg(long)]
        no_index: bool,
        /// Generate a short description per chunk before embedding.
        #[arg(long)]
        with_descriptions: bool,
    },
    /// Re-index already built context documents without re-executing plugins.
    Index {
        #[arg(long = "datasource")]
        datasource_ids: Vec<String>,
    },
    /// Check connectivity for configured datasources.
    Check {
        #[arg(long = "datasource")]
        datasource_ids: Vec<String>,
    },
    /// Delete all indexed chunks (and their vectors) for a datasource.
    Clean { datasource_id: String },
    /// Search the built context index.
    Search {
        text: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long = "datasource")]
        datasource_ids: Vec<String>,
        #[arg(long, value_enum, default_value_t = SearchModeArg::Hybrid)]
        mode: SearchModeArg,
        #[arg(long, value_enum, default_value_t = RagModeArg::Raw)]
        rag: RagModeArg,
    },
    /// Execute SQL against a datasource (read-only unless --write).
    Sql {
        datasource_id: String,
        sql: String,
        #[arg(long)]
        write: bool,
    },
    /// Print built context documents.
    Contexts {
        /// Print a single datasource's context.
        datasource_id: Option<String>,
        /// Join all contexts with per-datasource headers.
        #[arg(long)]
        formatted: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SearchModeArg {
    Keyword,
    Vector,
    Hybrid,
}

impl From<SearchModeArg> for SearchMode {
    fn from(value: SearchModeArg) -> Self {
        match value {
            SearchModeArg::Keyword => SearchMode::KeywordSearch,
            SearchModeArg::Vector => SearchMode::VectorSearch,
            SearchModeArg::Hybrid => SearchMode::HybridSearch,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum RagModeArg {
    Raw,
    Instruct,
    Rewrite,
}

impl From<RagModeArg> for RagMode {
    fn from(value: RagModeArg) -> Self {
        match value {
            RagModeArg::Raw => RagMode::RawQuery,
            RagModeArg::Instruct => RagMode::QueryWithInstruction,
            RagModeArg::Rewrite => RagMode::RewriteQuery,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("Error: {err}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// User errors exit 1, system errors exit 2.
fn exit_code_for(err: &EngineError) -> u8 {
    match err {
        EngineError::Validation(_)
        | EngineError::NotFound(_)
        | EngineError::NotSupported(_)
        | EngineError::Permission(_) => 1,
        _ => 2,
    }
}

async fn run(cli: Cli) -> Result<(), EngineError> {
    let config = get_config().map_err(|err| EngineError::Config(err.to_string()))?;

    let project_dir = cli
        .project_dir
        .clone()
        .unwrap_or_else(|| config.project_dir.clone());

    if let Command::Init = cli.command {
        let layout = ProjectLayout::new(&project_dir);
        layout.ensure_created()?;
        println!("Initialized context project at {}", layout.project_dir.display());
        return Ok(());
    }

    let layout = ProjectLayout::ensure_project_dir(&project_dir)?;
    let db = Arc::new(
        SurrealDbClient::open(&layout.state_db_address(), STORE_NAMESPACE, STORE_DATABASE)
            .await?,
    );
    db.ensure_initialized().await?;

    let registry = Arc::new(default_plugin_registry(&config));
    let embedding_provider: Arc<dyn EmbeddingProvider> =
        Arc::new(OpenAiEmbeddingProvider::from_config(&config));
    let prompt_provider: Arc<dyn PromptProvider> =
        Arc::new(OpenAiPromptProvider::from_config(&config));

    match cli.command {
        Command::Init => unreachable!("handled before the store is opened"),
        Command::Build {
            datasource_ids,
            no_index,
            with_descriptions,
        } => {
            let mode = if with_descriptions {
                ChunkEmbeddingMode::GeneratedDescriptions
            } else {
                ChunkEmbeddingMode::EmbeddableTextOnly
            };
            let descriptions = with_descriptions
                .then(|| DescriptionProvider::new(Arc::clone(&prompt_provider)));

            let embedding_service = ChunkEmbeddingService::new(
                Arc::clone(&db),
                Arc::clone(&embedding_provider),
                descriptions,
                mode,
            );
            let orchestrator = BuildOrchestrator::new(
                Arc::clone(&db),
                layout.clone(),
                Arc::clone(&registry),
                embedding_service,
            );

            let summary = orchestrator
                .build(BuildOptions {
                    datasource_ids: parse_datasource_ids(&datasource_ids)?,
                    generate_embeddings: !no_index,
                })
                .await?;

            println!("Run {} finished: {:?}", summary.run_id, summary.status);
            for outcome in &summary.outcomes {
                match &outcome.error {
                    Some(error) => println!("  {}  FAILED: {error}", outcome.datasource_id),
                    None => println!(
                        "  {}  {} chunks",
                        outcome.datasource_id, outcome.chunk_count
                    ),
                }
            }
            Ok(())
        }
        Command::Index { datasource_ids } => {
            let embedding_service = ChunkEmbeddingService::new(
                Arc::clone(&db),
                Arc::clone(&embedding_provider),
                None,
                ChunkEmbeddingMode::EmbeddableTextOnly,
            );
            let indexer = ContextIndexer::new(
                Arc::clone(&db),
                layout.clone(),
                Arc::clone(&registry),
                embedding_service,
            );

            let ids = parse_datasource_ids(&datasource_ids)?;
            let summary = indexer.index_built_contexts(ids.as_deref()).await?;

            println!("Index run {} finished: {:?}", summary.run_id, summary.status);
            for outcome in &summary.outcomes {
                match &outcome.error {
                    Some(error) => println!("  {}  FAILED: {error}", outcome.datasource_id),
                    None => println!(
                        "  {}  {} chunks",
                        outcome.datasource_id, outcome.chunk_count
                    ),
                }
            }
            Ok(())
        }
        Command::Check { datasource_ids } => {
            let ids = parse_datasource_ids(&datasource_ids)?;
            let outcomes =
                check_datasource_connections(&layout, &registry, ids.as_deref()).await?;

            for outcome in &outcomes {
                match &outcome.error {
                    Some(error) => println!("  {}  FAILED: {error}", outcome.datasource_id),
                    None => println!("  {}  OK", outcome.datasource_id),
                }
            }
            Ok(())
        }
        Command::Clean { datasource_id } => {
            let id = DatasourceId::from_string_repr(&datasource_id)?;
            let deleted = cleanup::delete_datasource_chunks(&db, &id.to_string()).await?;
            println!("Deleted {deleted} chunks for {id}");
            Ok(())
        }
        Command::Search {
            text,
            limit,
            datasource_ids,
            mode,
            rag,
        } => {
            let retrieve_service = RetrieveService::new(
                Arc::clone(&db),
                embedding_provider,
                Some(prompt_provider),
            );
            let engine = ContextEngine::new(layout, registry, retrieve_service);

            let ids = parse_datasource_ids(&datasource_ids)?;
            let results = engine
                .search_context(&text, limit, ids.as_deref(), rag.into(), mode.into())
                .await?;

            for result in results {
                println!(
                    "[{:.4}] {} ({})",
                    result.score.score(),
                    result.datasource_id,
                    result.full_type
                );
                println!("{}", result.display_text);
                println!();
            }
            Ok(())
        }
        Command::Sql {
            datasource_id,
            sql,
            write,
        } => {
            let retrieve_service = RetrieveService::new(
                Arc::clone(&db),
                embedding_provider,
                Some(prompt_provider),
            );
            let engine = ContextEngine::new(layout, registry, retrieve_service);

            let id = DatasourceId::from_string_repr(&datasource_id)?;
            let result = engine.run_sql(&id, &sql, &[], !write).await?;

            println!("{}", result.columns.join("\t"));
            for row in result.rows {
                let cells: Vec<String> = row.iter().map(ToString::to_string).collect();
                println!("{}", cells.join("\t"));
            }
            Ok(())
        }
        Command::Contexts {
            datasource_id,
            formatted,
        } => {
            let retrieve_service = RetrieveService::new(
                Arc::clone(&db),
                embedding_provider,
                Some(prompt_provider),
            );
            let engine = ContextEngine::new(layout, registry, retrieve_service);

            match datasource_id {
                Some(raw) => {
                    let id = DatasourceId::from_string_repr(&raw)?;
                    let context = engine.get_datasource_context(&id)?;
                    println!("{}", context.context);
                }
                None if formatted => println!("{}", engine.get_all_contexts_formatted()?),
                None => {
                    for id in engine.get_introspected_datasource_list()? {
                        println!("{id}");
                    }
                }
            }
            Ok(())
        }
    }
}

fn parse_datasource_ids(raw: &[String]) -> Result<Option<Vec<DatasourceId>>, EngineError> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.iter()
        .map(|value| DatasourceId::from_string_repr(value))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}
