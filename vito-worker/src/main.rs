use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use vito_data::protocol::{self, WorkerReply, WorkerRequest};
use vito_worker::bootstrap;
use vito_worker::engine::{EngineEvent, EventSink};
use vito_worker::host::{HostConfig, HostedEngineFactory};
use vito_worker::rpc::RpcBridge;
use vito_worker::state::WorkerState;

#[derive(Parser)]
#[command(name = "vito-worker")]
#[command(about = "Hosts Vitest execution contexts for one workspace folder")]
#[command(version)]
struct Cli {
    /// Engine host binary (overrides VITO_ENGINE_BIN)
    #[arg(long)]
    engine_bin: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout is the protocol channel; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut host_config = HostConfig::default();
    if let Some(binary) = cli.engine_bin {
        host_config.binary = binary;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<WorkerReply>();
    let writer = tokio::spawn(write_replies(reply_rx));

    // Engine events flow through their own channel onto the reply stream.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<(String, EngineEvent)>();
    {
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            while let Some((project, event)) = event_rx.recv().await {
                let _ = reply_tx.send(WorkerReply::Event {
                    project,
                    name: event.name,
                    payload: event.payload,
                });
            }
        });
    }

    // The first message must be the init command.
    let first = lines
        .next_line()
        .await
        .context("failed to read init command")?;
    let Some(first) = first else {
        bail!("stdin closed before the init command")
    };
    let request = protocol::decode_request(&first).context("failed to decode init command")?;
    let WorkerRequest::Init { meta, loader, pnp } = request else {
        bail!("expected an init command before anything else");
    };

    info!(projects = meta.len(), "initializing worker");
    let factory = HostedEngineFactory::new(host_config);
    let boot = bootstrap::initialize(&factory, meta, loader, pnp, event_tx.clone()).await;
    let settled = boot.state;
    let _ = reply_tx.send(boot.reply());

    if settled != WorkerState::Ready {
        warn!("no execution context constructed, shutting down");
        shutdown(event_tx, reply_tx, writer).await;
        return Ok(());
    }

    let bridge = Arc::new(RpcBridge::new(boot.contexts));
    info!(contexts = bridge.len(), "worker ready");

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request = match protocol::decode_request(&line) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "discarding undecodable request");
                continue;
            }
        };
        match request {
            WorkerRequest::Call {
                seq,
                method,
                params,
            } => {
                // Calls run concurrently so a long collect/run never blocks
                // a cancel arriving behind it.
                let bridge = Arc::clone(&bridge);
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    let reply = match bridge.dispatch(&method, params).await {
                        Ok(value) => WorkerReply::ok(seq, value),
                        Err(err) => WorkerReply::err(seq, err.to_string()),
                    };
                    let _ = reply_tx.send(reply);
                });
            }
            WorkerRequest::Close => {
                info!("close requested, disposing contexts");
                bridge.close().await;
                break;
            }
            WorkerRequest::Init { .. } => {
                error!("duplicate init command ignored");
            }
        }
    }

    shutdown(event_tx, reply_tx, writer).await;
    Ok(())
}

/// Close the outbound channels and give the writer a bounded window to
/// drain. Engine reader tasks drop their event senders once their child
/// processes are reaped.
async fn shutdown(
    event_tx: EventSink,
    reply_tx: mpsc::UnboundedSender<WorkerReply>,
    writer: tokio::task::JoinHandle<()>,
) {
    drop(event_tx);
    drop(reply_tx);
    if tokio::time::timeout(Duration::from_secs(5), writer)
        .await
        .is_err()
    {
        warn!("reply writer did not drain before shutdown");
    }
}

async fn write_replies(mut replies: mpsc::UnboundedReceiver<WorkerReply>) {
    let mut stdout = tokio::io::stdout();
    while let Some(reply) = replies.recv().await {
        let line = match protocol::encode(&reply) {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "failed to encode reply");
                continue;
            }
        };
        if stdout.write_all(line.as_bytes()).await.is_err()
            || stdout.write_all(b"\n").await.is_err()
            || stdout.flush().await.is_err()
        {
            break;
        }
    }
}
