use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lexflow::errors::PipelineError;
use lexflow::ingest::{run_ingest, run_reprocess, IngestConfig, IngestReport};
use lexflow::store::{PgStoreProvider, StoreProvider};

#[derive(Parser, Debug)]
#[command(
    name = "lexflow-ingest",
    about = "Bulk-load dictionary source files into the raw and typed stores"
)]
struct IngestCli {
    /// Source file (or CLDF dataset directory) to ingest
    #[arg(long, env = "LEXFLOW_INGEST_FILE")]
    file: PathBuf,

    /// Data source identifier recorded on every record
    #[arg(long, env = "LEXFLOW_SOURCE")]
    source: String,

    /// Input format: json, cldf, starling, tei, or csv
    #[arg(long, env = "LEXFLOW_FORMAT")]
    format: String,

    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Parallel cleaner workers (0 = number of cores)
    #[arg(long, env = "LEXFLOW_WORKERS", default_value_t = 0)]
    workers: usize,

    /// Records per file-read batch
    #[arg(long, env = "LEXFLOW_LOAD_BATCH", default_value_t = 20_000)]
    load_batch: usize,

    /// Records per cleaner batch
    #[arg(long, env = "LEXFLOW_CLEAN_BATCH", default_value_t = 5_000)]
    clean_batch: usize,

    /// Entries per bulk write batch
    #[arg(long, env = "LEXFLOW_WRITE_BATCH", default_value_t = 10_000)]
    write_batch: usize,

    /// Parallel typed-store writers
    #[arg(long, env = "LEXFLOW_WRITERS", default_value_t = 2)]
    writers: usize,

    /// Minimum entry quality to store
    #[arg(long, env = "LEXFLOW_QUALITY_THRESHOLD", default_value_t = 0.5)]
    quality_threshold: f64,

    /// Resume the transform phase after the last committed checkpoint
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// Rerun cleaning over already-loaded raw records (skips the file load)
    #[arg(long, default_value_t = false)]
    reprocess: bool,

    /// Parse and count without writing anything
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn run(cli: IngestCli) -> Result<IngestReport> {
    let mut config = IngestConfig::new(cli.file, cli.source, cli.format);
    if cli.workers > 0 {
        config.cleaner_workers = cli.workers;
    }
    config.load_batch = cli.load_batch.max(1);
    config.clean_batch = cli.clean_batch.max(1);
    config.write_batch = cli.write_batch.max(1);
    config.writers = cli.writers.max(1);
    config.quality_threshold = cli.quality_threshold;
    config.resume = cli.resume;
    config.dry_run = cli.dry_run;

    let provider: Arc<dyn StoreProvider> =
        Arc::new(PgStoreProvider::new(cli.database_url.as_str(), 0));

    if cli.reprocess {
        run_reprocess(provider, config).context("reprocessing failed")
    } else {
        run_ingest(provider, config).context("ingestion failed")
    }
}

fn main() {
    let cli = IngestCli::parse();
    match run(cli) {
        Ok(report) => {
            println!(
                "{} loaded, {} raw inserted, {} entries written",
                report.loaded, report.raw_inserted, report.entries_written
            );
        }
        Err(err) => {
            eprintln!("{err:#}");
            let code = err
                .downcast_ref::<PipelineError>()
                .map(PipelineError::exit_code)
                .unwrap_or(70);
            std::process::exit(code);
        }
    }
}
