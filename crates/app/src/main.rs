use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tiered_rag_core::{
    ingest_best_effort, BlankPolicy, CharacterNgramEmbedder, ChatModel, Embedder,
    HierarchicalStore, IngestionPipeline, MetadataMode, OpenAiChatModel, OpenAiEmbedder,
    PageExtractor, QdrantStore, RagConfig, RetrievalOutcome, Retriever, RetryPolicy,
    VectorBackend,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tiered-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML config file; environment variables override its values.
    #[arg(long, env = "TIERED_RAG_CONFIG")]
    config: Option<PathBuf>,

    /// Qdrant base URL
    #[arg(long)]
    qdrant_url: Option<String>,

    /// Logical collection name
    #[arg(long)]
    collection: Option<String>,

    /// Folder holding the pdfium shared library.
    #[cfg(feature = "pdfium")]
    #[arg(long, env = "PDFIUM_DIR")]
    pdfium_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a PDF, or every PDF under a folder, into the collection.
    Ingest {
        /// PDF file or folder searched recursively.
        #[arg(long)]
        path: PathBuf,
        /// Only process the first N pages of each document.
        #[arg(long)]
        max_pages: Option<u32>,
        /// Drop the collection and invalidate cached page analysis first.
        #[arg(long, default_value_t = false)]
        force_recreate: bool,
        /// Tag chunks with keyword heuristics instead of a model call.
        #[arg(long, default_value_t = false)]
        heuristic_metadata: bool,
    },
    /// Retrieve parent context for a question.
    Search {
        #[arg(long)]
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
        /// Print results as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show point counts and state of the collection.
    Status,
    /// Delete both tiers of the collection.
    Drop,
}

fn load_config(cli: &Cli) -> anyhow::Result<RagConfig> {
    let mut config = RagConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = &cli.qdrant_url {
        config.backend.qdrant_url = url.clone();
    }
    if let Some(collection) = &cli.collection {
        config.backend.collection = collection.clone();
    }
    config.validate()?;
    Ok(config)
}

fn build_backend(config: &RagConfig) -> anyhow::Result<Arc<dyn VectorBackend>> {
    let store = QdrantStore::new(
        &config.backend.qdrant_url,
        config.backend.api_key.as_deref(),
        config.models.ingest_timeout,
    )?;
    Ok(Arc::new(store))
}

/// Without credentials the offline character n-gram embedder is used, sized
/// to the configured dimensions so the collection layout stays the same.
fn build_embedder(config: &RagConfig) -> anyhow::Result<Arc<dyn Embedder>> {
    match config.models.api_key.as_deref() {
        Some(key) => Ok(Arc::new(OpenAiEmbedder::new(
            &config.models.base_url,
            Some(key),
            config.models.embedding_model.clone(),
            config.models.embedding_dimensions,
            config.models.ingest_timeout,
            RetryPolicy::new(config.models.max_retries),
        )?)),
        None => {
            warn!(
                dimensions = config.models.embedding_dimensions,
                "OPENAI_API_KEY not set, using character n-gram embeddings"
            );
            Ok(Arc::new(CharacterNgramEmbedder {
                dimensions: config.models.embedding_dimensions,
            }))
        }
    }
}

fn build_chat_model(config: &RagConfig, model: &str) -> anyhow::Result<Arc<dyn ChatModel>> {
    let client = OpenAiChatModel::new(
        &config.models.base_url,
        config.models.api_key.as_deref(),
        model,
        config.models.ingest_timeout,
        RetryPolicy::new(config.models.max_retries),
    )
    .with_context(|| format!("building client for {model}"))?;
    Ok(Arc::new(client))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        collection = %config.backend.collection,
        "tiered-rag boot"
    );

    let backend = build_backend(&config)?;
    let embedder = build_embedder(&config)?;

    match cli.command {
        Command::Ingest {
            ref path,
            max_pages,
            force_recreate,
            heuristic_metadata,
        } => {
            let mut options = config.ingestion_options();
            if max_pages.is_some() {
                options.max_pages = max_pages;
            }
            options.force_recreate = force_recreate;
            if heuristic_metadata {
                options.metadata_mode = MetadataMode::Heuristic;
            }

            let store =
                HierarchicalStore::open(backend, &config.backend.collection, embedder.dimensions())
                    .await?;
            let policy = BlankPolicy {
                white_ratio: config.pipeline.blank_white_ratio,
                brightness: config.pipeline.blank_brightness,
                ..BlankPolicy::default()
            };
            let extractor = PageExtractor::default()
                .with_policy(policy)
                .with_image_dir(&config.pipeline.image_dir);
            #[cfg(feature = "pdfium")]
            let extractor = extractor.with_rasterizer(Arc::new(
                tiered_rag_core::PdfiumRasterizer::new(cli.pdfium_dir.clone()),
            ));
            if cfg!(not(feature = "pdfium")) {
                warn!("built without pdfium, pages go to the vision model as text only");
            }

            let vision = build_chat_model(&config, &config.models.vision_model)?;
            let mut pipeline = IngestionPipeline::new(
                extractor,
                vision,
                embedder,
                store,
                &config.pipeline.cache_dir,
                options.clone(),
            )?
            .with_report_dir(&config.pipeline.report_dir);
            if options.metadata_mode == MetadataMode::Model {
                pipeline = pipeline
                    .with_metadata_model(build_chat_model(&config, &config.models.metadata_model)?);
            }

            let report = ingest_best_effort(&mut pipeline, path).await?;
            for run in &report.runs {
                if run.unchanged {
                    println!("{}: unchanged, skipped", run.source_file);
                    continue;
                }
                println!(
                    "{}: pages={} blank={} skipped={} parents={} children={} cost=${:.4}",
                    run.source_file,
                    run.pages_processed,
                    run.blank_pages.len(),
                    run.skipped_pages.len(),
                    run.parents_written,
                    run.children_written,
                    run.cost.total_cost_usd
                );
                if let Some(report_path) = &run.cost_report_path {
                    println!("  cost report: {}", report_path.display());
                }
            }
            for skipped in &report.skipped_files {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped pdf");
                println!("{}: skipped ({})", skipped.path.display(), skipped.reason);
            }
            println!(
                "{} children ingested, total cost ${:.4}",
                report.children_written(),
                report.total_cost_usd()
            );
        }
        Command::Search {
            ref query,
            top_k,
            json,
        } => {
            let store =
                HierarchicalStore::attach(backend, &config.backend.collection, embedder.dimensions())
                    .await?;
            let retriever = Retriever::new(Arc::new(store), embedder)
                .with_query_timeout(config.models.query_timeout)
                .with_fallback_scan_limit(config.retrieval.fallback_scan_limit);

            let k = top_k.unwrap_or(config.retrieval.top_k);
            let outcome = retriever.retrieve(query, k, None).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.to_json())?);
                return Ok(());
            }

            match &outcome {
                RetrievalOutcome::NoData => {
                    println!("collection {} holds no data, ingest documents first", config.backend.collection);
                    return Ok(());
                }
                RetrievalOutcome::Fallback(_) => {
                    println!("vector search unavailable, showing keyword-ranked fallback results");
                }
                RetrievalOutcome::Ranked(_) => {}
            }

            println!("query: {query}");
            for (rank, result) in outcome.results().iter().enumerate() {
                println!(
                    "[{}] score={:.4} page={} file={} topic={} ({})",
                    rank + 1,
                    result.similarity_score,
                    result.source.source_page,
                    result.source.source_file,
                    result.source.topic,
                    result.relevance_reason
                );
                println!("  child: {}", result.child_content);
                println!("  context:\n{}", result.parent_content);
            }
        }
        Command::Status => {
            let store =
                HierarchicalStore::attach(backend, &config.backend.collection, embedder.dimensions())
                    .await?;
            let status = store.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Drop => {
            let store =
                HierarchicalStore::attach(backend, &config.backend.collection, embedder.dimensions())
                    .await?;
            store.drop_collection().await?;
            println!("collection {} dropped", config.backend.collection);
        }
    }

    Ok(())
}
