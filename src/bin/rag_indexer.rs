use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use sha2::{Digest, Sha256};

use llm_gateway::cache::ResponseCache;
use llm_gateway::config::Settings;
use llm_gateway::indexer::extractor::extract_text;
use llm_gateway::indexer::walker::{walk_directory, SupportedFormat};
use llm_gateway::proxy::{LlmBackend, OllamaProxy};
use llm_gateway::rag::embeddings::CachedEmbedder;
use llm_gateway::rag::vector_store::Payload;
use llm_gateway::rag::{build_vector_store, IngestRequest, RagDefaults, RagPipeline};

#[derive(Parser, Debug)]
#[command(name = "rag-indexer")]
#[command(about = "Index a directory of documents into a RAG collection")]
struct Args {
    /// Directory to index
    #[arg(short, long)]
    dir: PathBuf,

    /// Target collection (defaults to DEFAULT_COLLECTION)
    #[arg(short, long)]
    collection: Option<String>,

    /// Only index files directly inside the directory
    #[arg(long)]
    flat: bool,

    /// Maximum chunk size in characters (defaults to CHUNK_SIZE)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Overlap between chunks in characters (defaults to CHUNK_OVERLAP)
    #[arg(long)]
    chunk_overlap: Option<usize>,
}

/// Short stable identifier for a file path.
fn document_id(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    hex::encode(&digest[..8])
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    if !args.dir.is_dir() {
        anyhow::bail!("Directory does not exist: {}", args.dir.display());
    }

    let llm: Arc<dyn LlmBackend> = Arc::new(OllamaProxy::from_settings(&settings));
    let cache = Arc::new(ResponseCache::connect(&settings).await);
    let store = build_vector_store(&settings).context("Failed to open vector store")?;
    let pipeline = RagPipeline::new(
        Arc::new(CachedEmbedder::new(llm.clone(), cache)),
        llm,
        store,
        RagDefaults::from_settings(&settings),
    );
    let collection = args
        .collection
        .clone()
        .unwrap_or_else(|| settings.default_collection.clone());

    if pipeline.store().collection_exists(&collection).await {
        println!("Appending to existing collection: {}", collection);
    } else {
        println!("Collection {} will be created on first ingest", collection);
    }

    println!("Scanning directory: {}", args.dir.display());
    let files = walk_directory(&args.dir, !args.flat);
    println!("Found {} supported files", files.len());

    if files.is_empty() {
        println!("No supported files found. Exiting.");
        return Ok(());
    }

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut indexed = 0usize;
    let mut skipped = 0usize;
    let mut total_chunks = 0usize;
    let mut failed_files: Vec<(PathBuf, String)> = Vec::new();

    for (path, format) in &files {
        pb.set_message(
            path.file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
        );

        match index_file(&pipeline, path, *format, &collection, &args).await {
            Ok(0) => skipped += 1,
            Ok(chunks) => {
                indexed += 1;
                total_chunks += chunks;
            }
            Err(e) => {
                tracing::warn!("Failed to index {}: {:#}", path.display(), e);
                failed_files.push((path.clone(), format!("{:#}", e)));
            }
        }

        pb.inc(1);
    }

    pb.finish_with_message("done");

    println!("\nIndexing complete!");
    println!("  Files indexed:   {}/{}", indexed, files.len());
    println!("  Files empty:     {}", skipped);
    println!("  Files failed:    {}", failed_files.len());
    println!("  Total chunks:    {}", total_chunks);
    println!("  Collection:      {}", collection);

    if !failed_files.is_empty() {
        println!("\nFailed files:");
        for (path, err) in &failed_files {
            println!("  {}: {}", path.display(), err);
        }
    }

    Ok(())
}

/// Extracts and ingests one file, returning the number of chunks stored.
async fn index_file(
    pipeline: &RagPipeline,
    path: &Path,
    format: SupportedFormat,
    collection: &str,
    args: &Args,
) -> Result<usize> {
    let text = extract_text(path, format)?;
    if text.trim().is_empty() {
        return Ok(0);
    }

    let mut metadata = Payload::new();
    metadata.insert("source".into(), json!(path.to_string_lossy()));
    metadata.insert(
        "file_name".into(),
        json!(path.file_name().unwrap_or_default().to_string_lossy()),
    );
    metadata.insert("format".into(), json!(format!("{:?}", format)));
    metadata.insert("document_id".into(), json!(document_id(path)));

    let result = pipeline
        .ingest(IngestRequest {
            content: text,
            metadata,
            collection: Some(collection.to_string()),
            chunk_size: args.chunk_size,
            chunk_overlap: args.chunk_overlap,
        })
        .await?;
    Ok(result.chunks_created)
}
