use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lexflow::embedding::{CachedEmbedder, Embedder, HashingEmbedder, RemoteEmbedder};
use lexflow::enrich::{run_enrich, EnrichConfig};
use lexflow::errors::PipelineError;
use lexflow::stage::io_runtime;
use lexflow::store::{PgStoreProvider, PgVectorCache, StoreProvider};

#[derive(Parser, Debug)]
#[command(
    name = "lexflow-process",
    about = "Fill entry embeddings through the batched, cached encoder pipeline"
)]
struct ProcessCli {
    /// Restrict to entries from one data source
    #[arg(long, env = "LEXFLOW_SOURCE")]
    source: Option<String>,

    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Texts per encoder call
    #[arg(long, env = "LEXFLOW_EMBED_BATCH", default_value_t = 512)]
    embed_batch: usize,

    /// Parallel store writers
    #[arg(long, env = "LEXFLOW_WRITERS", default_value_t = 2)]
    writers: usize,

    /// Embedding vector dimension
    #[arg(long, env = "LEXFLOW_DIMENSION", default_value_t = 768)]
    dimension: usize,

    /// Re-embed entries that already carry an embedding
    #[arg(long, default_value_t = false)]
    recompute: bool,

    /// OpenAI-compatible embeddings endpoint base URL
    #[arg(long, env = "LEXFLOW_EMBED_ENDPOINT")]
    embed_endpoint: Option<String>,

    /// API key for the embeddings endpoint
    #[arg(long, env = "LEXFLOW_EMBED_API_KEY")]
    embed_api_key: Option<String>,

    /// Embedding model identifier
    #[arg(
        long,
        env = "LEXFLOW_EMBED_MODEL",
        default_value = "text-embedding-3-small"
    )]
    embed_model: String,

    /// Seconds to wait for each embedding request
    #[arg(long, env = "LEXFLOW_EMBED_TIMEOUT_SECS", default_value_t = 30)]
    embed_timeout_secs: u64,

    /// Retries for rate limits and transient embedder errors
    #[arg(long, env = "LEXFLOW_EMBED_MAX_RETRIES", default_value_t = 5)]
    embed_max_retries: usize,

    /// Use the deterministic in-process hashing encoder instead of a remote
    /// endpoint
    #[arg(long, default_value_t = false)]
    hash_embedder: bool,

    /// In-process LRU capacity, in vectors
    #[arg(long, env = "LEXFLOW_CACHE_SIZE", default_value_t = 100_000)]
    cache_size: usize,

    /// Skip the shared Postgres embedding cache
    #[arg(long, default_value_t = false)]
    no_shared_cache: bool,

    /// Print the named pipeline's latest checkpoint before starting
    #[arg(long)]
    resume_from: Option<String>,
}

fn build_embedder(cli: &ProcessCli) -> Result<Arc<dyn Embedder>> {
    if cli.hash_embedder {
        return Ok(Arc::new(HashingEmbedder::new(cli.dimension)));
    }
    let endpoint = cli
        .embed_endpoint
        .clone()
        .context("--embed-endpoint is required unless --hash-embedder is set")?;
    let api_key = cli
        .embed_api_key
        .clone()
        .context("--embed-api-key is required unless --hash-embedder is set")?;
    let embedder = RemoteEmbedder::new(
        api_key,
        endpoint,
        cli.embed_model.clone(),
        cli.dimension,
        Duration::from_secs(cli.embed_timeout_secs.max(1)),
        cli.embed_max_retries.max(1),
        cli.embed_batch.max(1),
    )
    .context("failed to build remote embedder")?;
    Ok(Arc::new(embedder))
}

fn run(cli: ProcessCli) -> Result<()> {
    let provider: Arc<dyn StoreProvider> =
        Arc::new(PgStoreProvider::new(cli.database_url.as_str(), cli.dimension));

    if let Some(pipeline_name) = &cli.resume_from {
        let runtime = io_runtime()?;
        runtime
            .block_on(async {
                let checkpoints = provider.checkpoint_store().await?;
                match checkpoints.latest(pipeline_name).await? {
                    Some(checkpoint) => eprintln!(
                        "checkpoint for {pipeline_name}: {} processed, {} succeeded; \
                         writes are idempotent, continuing from the store state",
                        checkpoint.processed, checkpoint.succeeded
                    ),
                    None => eprintln!("no checkpoint recorded for {pipeline_name}"),
                }
                Ok::<(), PipelineError>(())
            })
            .context("failed to read checkpoint")?;
    }

    let mut cached = CachedEmbedder::new(build_embedder(&cli)?, cli.cache_size.max(1));
    if !cli.no_shared_cache {
        match PgVectorCache::connect(&cli.database_url) {
            Ok(shared) => cached = cached.with_shared_cache(Arc::new(shared)),
            Err(err) => {
                eprintln!("shared embedding cache unavailable, continuing without it: {err}")
            }
        }
    }

    let config = EnrichConfig {
        source_id: cli.source.clone(),
        embed_batch: cli.embed_batch.max(1),
        writers: cli.writers.max(1),
        recompute: cli.recompute,
        ..EnrichConfig::default()
    };

    let report =
        run_enrich(provider, Arc::new(cached), config).context("enrichment failed")?;
    println!(
        "{} scanned, {} encoded, {} written (cache hit rate {:.3})",
        report.scanned, report.encoded, report.written, report.cache_hit_rate
    );
    Ok(())
}

fn main() {
    let cli = ProcessCli::parse();
    if let Err(err) = run(cli) {
        eprintln!("{err:#}");
        let code = err
            .downcast_ref::<PipelineError>()
            .map(PipelineError::exit_code)
            .unwrap_or(70);
        std::process::exit(code);
    }
}
