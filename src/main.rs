//! CLI entry point for the zotsave tool.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use zotsave_core::{CaptureTarget, PublishOrchestrator};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!("Zotsave starting");

    let target = args.target();
    if let CaptureTarget::ExistingFile(path) = &target {
        anyhow::ensure!(path.is_file(), "input file does not exist: {}", path.display());
    }

    let config = args.to_config();
    if config.credentials.is_none() {
        warn!(
            "No API credentials configured (--api-key/--library-id); \
             publishing requires them even via the connector"
        );
    }

    let orchestrator = PublishOrchestrator::new(config)?;

    let result = match args.deadline {
        Some(secs) => {
            orchestrator
                .run_with_deadline(&target, Duration::from_secs(secs))
                .await
        }
        None => orchestrator.run(&target).await,
    };

    let result = match result {
        Ok(result) => result,
        Err(error) => {
            if let Some(artifact) = error.captured_artifact() {
                // The capture succeeded; don't throw it away with the error.
                salvage_artifact(&args, artifact)?;
            }
            return Err(error.into());
        }
    };

    // Optional local copy alongside the library upload
    if let Some(ref dir) = args.output_dir {
        let path = dir.join(&result.artifact.filename);
        std::fs::write(&path, &result.artifact.pdf)
            .with_context(|| format!("could not write local copy to {}", path.display()))?;
        info!(path = %path.display(), "Local copy written");
    }

    for warning in &result.warnings {
        warn!(warning, "Publish completed with warning");
    }

    info!(
        item = %result.item_id,
        attachment = ?result.attachment_id,
        transport = %result.transport_used,
        "Saved to Zotero"
    );

    Ok(())
}

/// Writes a stranded capture artifact to disk so the render work survives a
/// transport failure.
fn salvage_artifact(args: &Args, artifact: &zotsave_core::CaptureArtifact) -> Result<()> {
    let dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    let path = dir.join(&artifact.filename);
    std::fs::write(&path, &artifact.pdf)
        .with_context(|| format!("could not write salvaged PDF to {}", path.display()))?;
    warn!(path = %path.display(), "No transport available; captured PDF written locally");
    Ok(())
}
