//! Forgestat binary — thin batch-query driver over the `forgestat-core`
//! engine. Builds (or reopens) the persisted catalogue, then executes a file
//! of queries, one per line, into the output directory.

use clap::Parser;
use forgestat_core::{query, Catalog, EngineConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

/// Bounded-memory analytics over code-hosting platform data.
#[derive(Parser)]
#[command(name = "forgestat", version, about)]
struct Cli {
    /// File with one query per line; each valid line N writes
    /// commandN_output.txt into the output directory
    queries: Option<PathBuf>,

    /// Directory holding users.csv, repos.csv and commits.csv
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Directory for query outputs and the persisted catalogue
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Ignore any persisted catalogue and re-ingest the text inputs
    #[arg(long)]
    rebuild: bool,

    /// Page frames in the block cache (1 KiB each)
    #[arg(long)]
    cache_frames: Option<usize>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("forgestat=info".parse().unwrap())
                .add_directive("forgestat_core=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let Some(queries) = cli.queries else {
        // The interactive viewer is a separate front end; this binary only
        // drives batches.
        eprintln!("usage: forgestat <queries-file>");
        return ExitCode::from(2);
    };

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut config = EngineConfig::load(&cwd);
    if let Some(dir) = cli.input_dir {
        config.input_dir = dir;
    }
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }
    if let Some(frames) = cli.cache_frames {
        config.cache_frames = frames.max(1);
    }

    let catalog = match Catalog::load_or_build(&config, cli.rebuild) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "could not open or build the catalogue");
            return ExitCode::FAILURE;
        }
    };
    match query::run_batch(&catalog, &queries) {
        Ok(executed) => {
            info!(executed, "batch complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "batch failed");
            ExitCode::FAILURE
        }
    }
}
