//! Worker process handles: spawn, init handshake, and the id-first RPC
//! call convention over each worker's stdio.
//!
//! The connection is generic over its reader/writer so tests can drive the
//! full protocol over in-memory pipes.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use vito_data::protocol::{self, ProjectFailure, WorkerReply, WorkerRequest};
use vito_data::{ProjectDescriptor, WorkspaceFolder};

/// How long a worker may take to settle its init handshake. Worker-side
/// initialization itself is unbounded; this is the controller's ceiling.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// An event received from one worker, tagged with its folder name.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerEvent {
    pub folder: String,
    pub project: String,
    pub name: String,
    pub payload: Value,
}

/// The worker's single init reply.
#[derive(Debug)]
pub enum InitOutcome {
    Ready { errors: Vec<ProjectFailure> },
    Failed { errors: Vec<ProjectFailure> },
}

type PendingCalls = Arc<AsyncMutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

/// Duplex protocol channel to one worker: a serialized writer plus a
/// reader loop that routes replies to pending calls, the init handshake,
/// and the event stream.
pub struct WorkerConnection<W> {
    writer: AsyncMutex<W>,
    pending: PendingCalls,
    next_seq: AtomicU64,
}

impl<W> WorkerConnection<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn start<R>(
        reader: R,
        writer: W,
        folder: String,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> (Arc<Self>, oneshot::Receiver<InitOutcome>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let pending: PendingCalls = Arc::new(AsyncMutex::new(HashMap::new()));
        let (init_tx, init_rx) = oneshot::channel();
        tokio::spawn(read_worker_replies(
            reader,
            Arc::clone(&pending),
            init_tx,
            events,
            folder,
        ));
        let connection = Arc::new(WorkerConnection {
            writer: AsyncMutex::new(writer),
            pending,
            next_seq: AtomicU64::new(1),
        });
        (connection, init_rx)
    }

    /// Send the init command and await the worker's single ready/error
    /// reply.
    pub async fn init(
        &self,
        meta: Vec<ProjectDescriptor>,
        loader: Option<std::path::PathBuf>,
        pnp: Option<std::path::PathBuf>,
        init_rx: oneshot::Receiver<InitOutcome>,
        timeout: Duration,
    ) -> Result<InitOutcome> {
        self.send(&WorkerRequest::Init { meta, loader, pnp }).await?;
        match tokio::time::timeout(timeout, init_rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => bail!("worker exited before reporting readiness"),
            Err(_) => bail!("worker did not report readiness within {:?}", timeout),
        }
    }

    /// Remote call: `method(projectId, ...args)`.
    pub async fn request(
        &self,
        method: &str,
        project: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);

        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(Value::String(project.to_string()));
        params.extend(args);

        let request = WorkerRequest::Call {
            seq,
            method: method.to_string(),
            params,
        };
        if let Err(err) = self.send(&request).await {
            self.pending.lock().await.remove(&seq);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(anyhow!(message)),
            Ok(Err(_)) => bail!("worker reply channel closed during '{}'", method),
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                bail!("call '{}' timed out after {:?}", method, timeout)
            }
        }
    }

    /// Request a full teardown: every context is disposed worker-side.
    pub async fn close(&self) -> Result<()> {
        self.send(&WorkerRequest::Close).await
    }

    async fn send(&self, request: &WorkerRequest) -> Result<()> {
        let line = protocol::encode(request).context("failed to encode worker request")?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .context("failed to write to worker")?;
        writer
            .write_all(b"\n")
            .await
            .context("failed to write to worker")?;
        writer.flush().await.context("failed to flush worker")?;
        Ok(())
    }
}

async fn read_worker_replies<R>(
    reader: R,
    pending: PendingCalls,
    init_tx: oneshot::Sender<InitOutcome>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    folder: String,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut init_tx = Some(init_tx);
    let reason = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break "worker process ended".to_string(),
            Err(err) => break format!("failed to read worker output: {}", err),
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match protocol::decode_reply(&line) {
            Ok(reply) => reply,
            Err(err) => {
                debug!(folder = %folder, error = %err, "discarding undecodable worker line");
                continue;
            }
        };

        match reply {
            WorkerReply::Ready { errors } => {
                if let Some(tx) = init_tx.take() {
                    let _ = tx.send(InitOutcome::Ready { errors });
                }
            }
            WorkerReply::Error { errors } => {
                if let Some(tx) = init_tx.take() {
                    let _ = tx.send(InitOutcome::Failed { errors });
                }
            }
            WorkerReply::Result { seq, ok, err } => {
                if let Some(sender) = pending.lock().await.remove(&seq) {
                    let outcome = match err {
                        Some(message) => Err(message),
                        None => Ok(ok.unwrap_or(Value::Null)),
                    };
                    let _ = sender.send(outcome);
                }
            }
            WorkerReply::Event {
                project,
                name,
                payload,
            } => {
                let _ = events.send(WorkerEvent {
                    folder: folder.clone(),
                    project,
                    name,
                    payload,
                });
            }
        }
    };

    // A handshake still waiting learns about the death here.
    if let Some(tx) = init_tx.take() {
        let _ = tx.send(InitOutcome::Failed {
            errors: vec![(String::new(), reason.clone())],
        });
    }
    let waiters: Vec<_> = {
        let mut pending = pending.lock().await;
        pending.drain().map(|(_, sender)| sender).collect()
    };
    if !waiters.is_empty() {
        warn!(folder = %folder, reason = %reason, "worker terminated with pending calls");
    }
    for waiter in waiters {
        let _ = waiter.send(Err(reason.clone()));
    }
}

/// One spawned worker process plus its protocol connection.
pub struct WorkerHandle {
    pub folder: WorkspaceFolder,
    connection: Arc<WorkerConnection<ChildStdin>>,
    child: AsyncMutex<Child>,
}

impl WorkerHandle {
    /// Spawn a worker for one folder's projects and run the init
    /// handshake. Worker logs pass through on stderr.
    pub async fn spawn(
        worker_bin: &Path,
        engine_bin: Option<&Path>,
        folder: WorkspaceFolder,
        meta: Vec<ProjectDescriptor>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<(Self, InitOutcome)> {
        let mut command = Command::new(worker_bin);
        if let Some(engine_bin) = engine_bin {
            command.arg("--engine-bin").arg(engine_bin);
        }
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::inherit());

        let mut child = command.spawn().with_context(|| {
            format!("failed to launch worker '{}'", worker_bin.display())
        })?;
        let stdin = child.stdin.take().context("worker stdin unavailable")?;
        let stdout = child.stdout.take().context("worker stdout unavailable")?;

        let (connection, init_rx) =
            WorkerConnection::start(stdout, stdin, folder.name.clone(), events);

        // The loader hook and pnp manifest are per-worker; the projects of
        // one folder share them.
        let loader = meta.iter().find_map(|project| project.loader.clone());
        let pnp = meta.iter().find_map(|project| project.pnp.clone());

        info!(folder = %folder.name, projects = meta.len(), "spawning worker");
        let outcome = connection
            .init(meta, loader, pnp, init_rx, HANDSHAKE_TIMEOUT)
            .await?;

        Ok((
            WorkerHandle {
                folder,
                connection,
                child: AsyncMutex::new(child),
            },
            outcome,
        ))
    }

    pub async fn request(&self, method: &str, project: &str, args: Vec<Value>) -> Result<Value> {
        self.connection
            .request(method, project, args, DEFAULT_CALL_TIMEOUT)
            .await
    }

    /// Tear the worker down: close message first, then reap (kill on a
    /// stuck exit).
    pub async fn close(&self) {
        let _ = self.connection.close().await;
        let mut child = self.child.lock().await;
        if tokio::time::timeout(Duration::from_secs(10), child.wait())
            .await
            .is_err()
        {
            warn!(folder = %self.folder.name, "worker did not exit after close, killing");
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}
