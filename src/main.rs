//! Elohim Chunks CLI
//!
//! Operates on a local chunk repository and runs the reconciliation loop.
//!
//! ## Usage
//!
//! ```bash
//! # Store a file (split into chunks, reconciled once)
//! elohim-chunks put ./video.mp4 --redundancy 3
//!
//! # Reassemble a stored file
//! elohim-chunks get <file-id> --out ./video.mp4
//!
//! # Show a file's statuses and chunks
//! elohim-chunks status <file-id>
//!
//! # List uploaded or downloaded files
//! elohim-chunks list
//!
//! # Run one reconciliation sweep
//! elohim-chunks sweep
//!
//! # Run the reconciler until Ctrl+C
//! elohim-chunks --storage-dir /data/chunks run
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use elohim_chunks::config::{millis_from_now, MAX_WINDOW_SECS};
use elohim_chunks::{
    Config, File, LinkEvent, NullTransport, Reconciler, Repository, StoreOptions,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "elohim-chunks")]
#[command(about = "Content-addressed chunk storage with redundancy tracking")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "ELOHIM_CHUNKS_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "ELOHIM_CHUNKS_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a file
    Put {
        path: PathBuf,

        /// Live replicas required (defaults to the configured redundancy)
        #[arg(long)]
        redundancy: Option<u32>,

        /// Retention window in seconds from now
        #[arg(long)]
        expires_in_secs: Option<u64>,

        #[arg(long)]
        autorenew: bool,
    },
    /// Reassemble a stored file
    Get {
        file_id: String,

        /// Output path (stdout if omitted)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Show a file's statuses and chunks
    Status { file_id: String },
    /// Delete a file and any chunks no other file uses
    Delete { file_id: String },
    /// List uploaded or downloaded files
    List,
    /// Run one reconciliation sweep
    Sweep,
    /// Run the reconciler until interrupted
    Run,
}

#[derive(Serialize)]
struct FileStatus {
    file: File,
    chunk_ids: Vec<String>,
    complete: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("elohim_chunks=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }

    tokio::fs::create_dir_all(&config.storage_dir).await?;
    let config_path = config.config_path();
    if args.config.is_none() && !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let repo = Repository::open(config).await?;

    match args.command {
        Command::Put {
            path,
            redundancy,
            expires_in_secs,
            autorenew,
        } => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            if let Some(secs) = expires_in_secs.filter(|secs| *secs > MAX_WINDOW_SECS) {
                anyhow::bail!("--expires-in-secs {} exceeds the maximum of {}", secs, MAX_WINDOW_SECS);
            }
            let expires = expires_in_secs.map(millis_from_now);

            let file = File::store(
                &repo,
                &data,
                StoreOptions {
                    original_path: Some(path.display().to_string()),
                    redundancy,
                    expires,
                    autorenew,
                    ..StoreOptions::default()
                },
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&file)?);
        }
        Command::Get { file_id, out } => {
            let file = File::find_or_fail(&repo, &file_id).await?;
            let data = file.reconstruct(&repo).await?;
            match out {
                Some(out) => {
                    tokio::fs::write(&out, &data)
                        .await
                        .with_context(|| format!("writing {}", out.display()))?;
                    info!(file_id = %file_id, bytes = data.len(), path = %out.display(), "Wrote file");
                }
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&data)?;
                }
            }
        }
        Command::Status { file_id } => {
            let file = File::find_or_fail(&repo, &file_id).await?;
            let status = FileStatus {
                chunk_ids: file.chunk_ids(&repo).await?,
                complete: file.is_complete(&repo).await?,
                file,
            };
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Delete { file_id } => {
            let file = File::find_or_fail(&repo, &file_id).await?;
            let removed = file.delete(&repo).await?;
            println!("{}", serde_json::to_string_pretty(&removed)?);
        }
        Command::List => {
            let files = repo.list_files().await?;
            println!("{}", serde_json::to_string_pretty(&files)?);
        }
        Command::Sweep => {
            let reconciler = Reconciler::new(repo.clone(), Arc::new(NullTransport));
            let report = reconciler.sweep().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Run => {
            let mut reconciler = Reconciler::new(repo.clone(), Arc::new(NullTransport));

            let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
            reconciler.set_shutdown(shutdown_rx);

            // No transport is wired in yet, so nothing sends link events
            let (_events_tx, events_rx) = mpsc::channel::<LinkEvent>(256);

            let handle = tokio::spawn(async move {
                if let Err(e) = reconciler.run(events_rx).await {
                    error!(error = %e, "Reconciler failed");
                }
            });

            info!("Press Ctrl+C to stop.");
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");

            let _ = shutdown_tx.send(());
            let _ = handle.await;
        }
    }

    let stats = repo.stats().await?;
    info!(
        chunks = stats.metadata.chunk_count,
        files = stats.metadata.file_count,
        links = stats.metadata.link_count,
        bytes_on_disk = stats.content.total_bytes,
        status_changes = stats.reconcile.status_changes,
        "Final storage stats"
    );

    Ok(())
}
