//! Hash files through a two-stage pipeline: read, then SHA-512.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use pipelite::arity::spread2;
use pipelite::{Pipeline, PipelineOptions, StageConfig, functions};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(
    name = "pipelite-hash",
    version,
    about = "Compute SHA-512 digests of files in parallel"
)]
struct Cli {
    /// Files or directories to hash (directories are walked recursively)
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Worker threads per stage (overrides the config file)
    #[arg(short, long)]
    workers: Option<usize>,

    /// JSON pipeline options file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    pipelite::init_logging(&cli.log_level)?;

    let mut options = match &cli.config {
        Some(path) => PipelineOptions::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => PipelineOptions::default(),
    };
    if let Some(workers) = cli.workers {
        options.workers = workers;
    }

    let mut pipeline = Pipeline::with_options(options)?
        .try_register_stage(StageConfig::named("read"), functions::read_file)?
        .register_stage(
            StageConfig::named("hash"),
            spread2(functions::sha512_hex),
        )?;
    pipeline.start()?;

    for root in &cli.paths {
        for entry in WalkDir::new(root) {
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    pipeline.submit(entry.into_path())?;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("skipping {}: {}", failed_path(&e, root).display(), e);
                }
            }
        }
    }

    for (path, digest) in pipeline.collect()? {
        println!("{}: {}", path.display(), digest);
    }

    let faults = pipeline.faults();
    for fault in &faults {
        match fault.input::<PathBuf>() {
            Some(path) => eprintln!("{}: {}", path.display(), fault.message()),
            None => eprintln!("{}", fault),
        }
    }

    let metrics = pipeline.metrics();
    tracing::info!(
        submitted = metrics.submitted,
        collected = metrics.collected,
        faulted = metrics.total_faulted(),
        "Hashing complete"
    );

    Ok(if faults.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Path of the entry a walk error refers to, falling back to the walk root.
fn failed_path<'a>(error: &'a walkdir::Error, root: &'a Path) -> &'a Path {
    error.path().unwrap_or(root)
}
