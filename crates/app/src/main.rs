use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use proposal_ingest_core::{
    CharacterNgramEmbedder, ChunkingConfig, Embedder, HttpEmbedder, HttpRecognizer, IndexConfig,
    Indexer, IngestPipeline, OcrConfig, OcrEngine, PdftoppmRasterizer, PipelineConfig,
    QdrantStore, SearchFilter, SimilarityMetric, DEFAULT_MAX_CONCURRENT_DOCUMENTS,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "proposal-ingest", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    index: IndexArgs,

    #[command(flatten)]
    ocr: OcrArgs,

    #[command(flatten)]
    chunking: ChunkingArgs,
}

#[derive(Args)]
struct IndexArgs {
    /// Directory holding the local vector collection.
    #[arg(long, env = "PROPOSAL_INDEX_DIR", default_value = "./data/vectordb")]
    persist_dir: PathBuf,

    /// Collection name.
    #[arg(long, env = "PROPOSAL_COLLECTION", default_value = "proposal_documents")]
    collection: String,

    /// Similarity metric: cosine, dot_product or euclidean.
    #[arg(long, env = "PROPOSAL_SIMILARITY_METRIC", default_value = "cosine")]
    similarity_metric: SimilarityMetric,

    /// Embedding dimensions.
    #[arg(long, env = "PROPOSAL_EMBEDDING_DIMENSIONS", default_value_t = proposal_ingest_core::DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    /// OpenAI-compatible embeddings endpoint. The offline trigram embedder is used when unset.
    #[arg(long, env = "PROPOSAL_EMBEDDING_URL")]
    embedding_url: Option<String>,

    /// Model name sent to the embeddings endpoint.
    #[arg(long, env = "PROPOSAL_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    embedding_model: String,

    #[arg(long, env = "PROPOSAL_EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,

    /// Qdrant base URL. The local store is used when unset.
    #[arg(long, env = "PROPOSAL_QDRANT_URL")]
    qdrant_url: Option<String>,
}

#[derive(Args)]
struct OcrArgs {
    /// Direct yield below this many characters triggers OCR.
    #[arg(long, env = "PROPOSAL_OCR_THRESHOLD_CHARS", default_value_t = 100)]
    ocr_threshold_chars: usize,

    /// Rasterization resolution for OCR.
    #[arg(long, env = "PROPOSAL_OCR_DPI", default_value_t = 300)]
    dpi: u32,

    #[arg(long, env = "PROPOSAL_FORCE_OCR", default_value_t = false)]
    force_ocr: bool,

    #[arg(long, env = "PROPOSAL_DISABLE_OCR", default_value_t = false)]
    disable_ocr: bool,

    /// Tesseract language pack.
    #[arg(long, env = "PROPOSAL_OCR_LANGUAGE", default_value = "eng")]
    ocr_language: String,

    /// Remote OCR endpoint used instead of tesseract.
    #[arg(long, env = "PROPOSAL_OCR_URL")]
    ocr_url: Option<String>,

    #[arg(long, env = "PROPOSAL_OCR_API_KEY", hide_env_values = true)]
    ocr_api_key: Option<String>,
}

#[derive(Args)]
struct ChunkingArgs {
    #[arg(long, env = "PROPOSAL_MAX_CHUNK_SIZE", default_value_t = 1000)]
    max_chunk_size: usize,

    #[arg(long, env = "PROPOSAL_CHUNK_OVERLAP", default_value_t = 200)]
    chunk_overlap: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a document or every supported document in a folder.
    Ingest {
        path: PathBuf,
        /// Descend into subfolders.
        #[arg(long, default_value_t = false)]
        recursive: bool,
        /// Clear the collection before ingesting.
        #[arg(long, default_value_t = false)]
        reset: bool,
        /// Documents processed at the same time.
        #[arg(long, env = "PROPOSAL_MAX_CONCURRENT_DOCUMENTS", default_value_t = DEFAULT_MAX_CONCURRENT_DOCUMENTS)]
        max_concurrent_documents: usize,
    },
    /// Return the chunks closest to a query.
    Search {
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "5")]
        top_k: usize,
        /// Print results as JSON lines.
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Only chunks from this file name.
        #[arg(long)]
        source_file: Option<String>,
        #[arg(long)]
        document_id: Option<String>,
        /// Only OCR-derived (true) or directly extracted (false) chunks.
        #[arg(long)]
        ocr_used: Option<bool>,
    },
    /// Delete every entry in the collection.
    Reset,
    /// Show collection statistics.
    Stats,
}

impl Cli {
    fn pipeline_config(&self, embedder: &dyn Embedder) -> PipelineConfig {
        PipelineConfig {
            ocr: OcrConfig {
                ocr_threshold_chars: self.ocr.ocr_threshold_chars,
                dpi: self.ocr.dpi,
                force_ocr: self.ocr.force_ocr,
                disable_ocr: self.ocr.disable_ocr,
                language: self.ocr.ocr_language.clone(),
            },
            chunking: ChunkingConfig {
                max_chunk_size: self.chunking.max_chunk_size,
                chunk_overlap: self.chunking.chunk_overlap,
                ..ChunkingConfig::default()
            },
            index: IndexConfig {
                collection: self.index.collection.clone(),
                persist_directory: self.index.persist_dir.clone(),
                embedding_model_id: embedder.model_id().to_string(),
                embedding_dimensions: embedder.dimensions(),
                similarity_metric: self.index.similarity_metric,
            },
            max_concurrent_documents: match &self.command {
                Command::Ingest {
                    max_concurrent_documents,
                    ..
                } => *max_concurrent_documents,
                _ => DEFAULT_MAX_CONCURRENT_DOCUMENTS,
            },
        }
    }

    fn embedder(&self) -> Arc<dyn Embedder> {
        match &self.index.embedding_url {
            Some(url) => Arc::new(HttpEmbedder::new(
                url.clone(),
                self.index.embedding_model.clone(),
                self.index.embedding_dimensions,
                self.index.embedding_api_key.clone(),
            )),
            None => Arc::new(CharacterNgramEmbedder {
                dimensions: self.index.embedding_dimensions,
            }),
        }
    }

    fn ocr_engine(&self, config: &OcrConfig) -> OcrEngine {
        match &self.ocr.ocr_url {
            Some(url) => OcrEngine::new(
                Arc::new(PdftoppmRasterizer::default()),
                Arc::new(HttpRecognizer::new(url.clone(), self.ocr.ocr_api_key.clone())),
                config.dpi,
            ),
            None => OcrEngine::tesseract(config),
        }
    }
}

async fn open_indexer(
    cli: &Cli,
    config: &IndexConfig,
    embedder: Arc<dyn Embedder>,
) -> anyhow::Result<Indexer> {
    match &cli.index.qdrant_url {
        Some(url) => {
            let manifest = Indexer::manifest_for(config, embedder.as_ref())?;
            let store = QdrantStore::new(url, manifest)?;
            store.ensure_collection().await?;
            Ok(Indexer::new(
                config.collection.clone(),
                config.similarity_metric,
                Arc::new(store),
                embedder,
            ))
        }
        None => Ok(Indexer::open_local(config, embedder).await?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let embedder = cli.embedder();
    let config = cli.pipeline_config(embedder.as_ref());
    config.validate()?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        collection = %config.index.collection,
        "proposal-ingest boot"
    );

    let indexer = Arc::new(open_indexer(&cli, &config.index, embedder).await?);

    match &cli.command {
        Command::Ingest {
            path,
            recursive,
            reset,
            ..
        } => {
            let pipeline =
                IngestPipeline::new(&config, cli.ocr_engine(&config.ocr), Arc::clone(&indexer))?;
            if *reset {
                indexer.reset().await?;
            }

            if path.is_dir() {
                let report = pipeline.ingest_folder(path, *recursive).await?;
                for outcome in &report.outcomes {
                    match &outcome.result {
                        Ok(document) => println!(
                            "ok   {} method={} pages={} chars={} chunks={} indexed={} failed_chunks={}",
                            outcome.path.display(),
                            document.extraction.method,
                            document.extraction.pages,
                            document.extraction.char_count,
                            document.chunks,
                            document.index.succeeded,
                            document.index.failed.len(),
                        ),
                        Err(error) => println!("fail {} {error}", outcome.path.display()),
                    }
                }

                let failed = report.failed().count();
                if failed > 0 {
                    warn!(failed, "some documents were not ingested");
                }
                println!(
                    "{} of {} documents ingested, {} chunks indexed at {}",
                    report.succeeded().count(),
                    report.outcomes.len(),
                    report.total_chunks(),
                    Utc::now().to_rfc3339()
                );
            } else {
                let report = pipeline.ingest_path(path).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        Command::Search {
            query,
            top_k,
            json,
            source_file,
            document_id,
            ocr_used,
        } => {
            let filter = SearchFilter {
                source_file: source_file.clone(),
                document_id: document_id.clone(),
                ocr_used: *ocr_used,
            };
            let hits = indexer.search_with(query, *top_k, &filter).await?;
            if hits.is_empty() {
                println!("no results");
            }

            for hit in hits {
                if *json {
                    println!("{}", serde_json::to_string(&hit)?);
                    continue;
                }
                println!(
                    "score={:.4} source={} pages={}-{} chunk={} ocr={}",
                    hit.score,
                    hit.metadata.source_file,
                    hit.metadata.page_range[0],
                    hit.metadata.page_range[1],
                    hit.metadata.chunk_index,
                    hit.metadata.ocr_used,
                );
                println!("  {}", hit.text.trim());
            }
        }
        Command::Reset => {
            indexer.reset().await?;
            println!("collection {} cleared", config.index.collection);
        }
        Command::Stats => {
            let stats = indexer.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
