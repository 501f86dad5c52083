use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vito_daemon::config::DaemonConfig;
use vito_daemon::workers::{InitOutcome, WorkerEvent, WorkerHandle};
use vito_data::discovery::resolve_vitest_packages;
use vito_data::{ProjectDescriptor, ResolutionCache, WorkspaceFolder};

#[derive(Parser)]
#[command(name = "vito-daemon")]
#[command(about = "Discovers Vitest projects and drives worker processes")]
#[command(version)]
struct Cli {
    /// Path to config file (default: ~/.config/vito/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a discovery pass and print the deduplicated project set as JSON
    Discover,

    /// Spawn one worker per workspace folder and stream test events as
    /// JSON lines until interrupted
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries command output; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = DaemonConfig::load(cli.config.as_ref())?;
    info!(folders = config.workspace.len(), "loaded config");

    match cli.command {
        Commands::Discover => discover(&config).await,
        Commands::Serve => serve(&config).await,
    }
}

async fn discover(config: &DaemonConfig) -> Result<()> {
    let cache = Mutex::new(ResolutionCache::new());
    let discovered = resolve_vitest_packages(
        &config.folders(),
        &config.settings(),
        &cache,
        // User-initiated discovery surfaces warnings interactively.
        true,
    )
    .await;

    if discovered.warned {
        warn!("some candidates failed package resolution or validation");
    }
    println!("{}", serde_json::to_string_pretty(&discovered.projects)?);
    Ok(())
}

async fn serve(config: &DaemonConfig) -> Result<()> {
    let cache = Mutex::new(ResolutionCache::new());
    let discovered =
        resolve_vitest_packages(&config.folders(), &config.settings(), &cache, true).await;
    if discovered.projects.is_empty() {
        bail!("no vitest projects discovered in the workspace");
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let cancel = CancellationToken::new();

    // One worker per folder, each hosting that folder's projects.
    let grouped = group_by_folder(&config.folders(), discovered.projects);
    let spawns = grouped.into_iter().map(|(folder, meta)| {
        let events_tx = events_tx.clone();
        async move {
            let result = WorkerHandle::spawn(
                &config.worker_bin,
                config.engine_bin.as_deref(),
                folder.clone(),
                meta,
                events_tx,
            )
            .await;
            (folder, result)
        }
    });

    let mut workers = Vec::new();
    for (folder, result) in join_all(spawns).await {
        match result {
            Ok((handle, InitOutcome::Ready { errors })) => {
                for (id, detail) in &errors {
                    warn!(folder = %folder.name, id = %id, detail = %detail, "project failed to initialize");
                }
                info!(folder = %folder.name, "worker ready");
                workers.push(handle);
            }
            Ok((handle, InitOutcome::Failed { errors })) => {
                for (id, detail) in &errors {
                    error!(folder = %folder.name, id = %id, detail = %detail, "worker initialization failure");
                }
                handle.close().await;
            }
            Err(err) => {
                error!(folder = %folder.name, error = %err, "failed to spawn worker");
            }
        }
    }
    if workers.is_empty() {
        bail!("no worker reported ready");
    }

    info!(workers = workers.len(), "serving, press ctrl-c to stop");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                cancel.cancel();
            }

            event = events_rx.recv() => {
                match event {
                    Some(event) => println!("{}", serde_json::to_string(&event)?),
                    None => break,
                }
            }
        }
    }

    for worker in &workers {
        worker.close().await;
    }
    Ok(())
}

/// Group descriptors under their owning folder, preserving folder order.
fn group_by_folder(
    folders: &[WorkspaceFolder],
    projects: Vec<ProjectDescriptor>,
) -> Vec<(WorkspaceFolder, Vec<ProjectDescriptor>)> {
    let mut by_path: HashMap<PathBuf, Vec<ProjectDescriptor>> = HashMap::new();
    for project in projects {
        by_path
            .entry(project.folder.path.clone())
            .or_default()
            .push(project);
    }

    folders
        .iter()
        .filter_map(|folder| {
            by_path
                .remove(&folder.path)
                .map(|meta| (folder.clone(), meta))
        })
        .collect()
}
