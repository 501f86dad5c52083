//! Production [`TestEngine`] implementation: the engine runs as an
//! external host process, launched once per execution context with an
//! explicit working directory and driven over line-delimited JSON on its
//! stdio. Run semantics live entirely in the host program.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::engine::{
    ApiServerMode, EngineEvent, EngineFactory, EngineOptions, EventSink, TestEngine,
};
use crate::error::{Result, WorkerError};

const DEFAULT_ENGINE_BINARY: &str = "vitest-host";
const ENV_ENGINE_BIN: &str = "VITO_ENGINE_BIN";

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub binary: PathBuf,
    pub base_args: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            binary: std::env::var_os(ENV_ENGINE_BIN)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE_BINARY)),
            base_args: Vec::new(),
        }
    }
}

pub struct HostedEngineFactory {
    config: HostConfig,
}

impl HostedEngineFactory {
    pub fn new(config: HostConfig) -> Self {
        HostedEngineFactory { config }
    }

    pub fn from_env() -> Self {
        Self::new(HostConfig::default())
    }
}

#[async_trait]
impl EngineFactory for HostedEngineFactory {
    async fn create(
        &self,
        options: EngineOptions,
        events: EventSink,
        project_id: &str,
    ) -> Result<Box<dyn TestEngine>> {
        let engine = HostedEngine::spawn(&self.config, options, events, project_id).await?;
        Ok(Box::new(engine))
    }
}

/// One live engine host process.
pub struct HostedEngine {
    stdin: Arc<AsyncMutex<ChildStdin>>,
    child: AsyncMutex<Child>,
    pending: Arc<AsyncMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>,
    next_request_id: AtomicU64,
}

impl HostedEngine {
    pub async fn spawn(
        config: &HostConfig,
        options: EngineOptions,
        events: EventSink,
        project_id: &str,
    ) -> Result<Self> {
        let mut command = Command::new(&config.binary);
        command.args(&config.base_args);
        if let Some(main) = &options.package_main {
            command.arg("--package-main").arg(main);
        }
        if let Some(config_file) = &options.config_file {
            command.arg("--config").arg(config_file);
        }
        if let Some(workspace_file) = &options.workspace_file {
            command.arg("--workspace").arg(workspace_file);
        }
        if let Some(loader) = &options.loader {
            command.arg("--loader").arg(loader);
        }
        if let Some(pnp) = &options.pnp {
            command.arg("--pnp").arg(pnp);
        }
        if let Some(arguments) = &options.arguments {
            command.arg("--script-args").arg(arguments);
        }
        if options.api == ApiServerMode::Disabled {
            command.arg("--no-api");
        }
        // Explicit base path; the worker never chdirs.
        command.current_dir(&options.root);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::null());

        let mut child = command.spawn().map_err(|err| {
            WorkerError::Engine(format!(
                "failed to launch engine host '{}': {}",
                config.binary.display(),
                err
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Engine("engine host stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Engine("engine host stdout unavailable".to_string()))?;

        let pending: Arc<AsyncMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>> =
            Arc::new(AsyncMutex::new(HashMap::new()));

        tokio::spawn(read_host_output(
            stdout,
            Arc::clone(&pending),
            events,
            project_id.to_string(),
        ));

        Ok(HostedEngine {
            stdin: Arc::new(AsyncMutex::new(stdin)),
            child: AsyncMutex::new(child),
            pending,
            next_request_id: AtomicU64::new(1),
        })
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let message = json!({ "id": id, "method": method, "params": params });
        if let Err(err) = self.send(&message).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Engine(format!(
                "engine host dropped request '{}'",
                method
            ))),
        }
    }

    async fn send(&self, value: &Value) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(encoded.as_bytes())
            .await
            .map_err(|err| WorkerError::Engine(format!("failed to write to engine host: {}", err)))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|err| WorkerError::Engine(format!("failed to write to engine host: {}", err)))?;
        stdin
            .flush()
            .await
            .map_err(|err| WorkerError::Engine(format!("failed to flush engine host: {}", err)))?;
        Ok(())
    }
}

#[async_trait]
impl TestEngine for HostedEngine {
    async fn collect_tests(&self, args: Vec<Value>) -> Result<Value> {
        self.request("collectTests", Value::Array(args)).await
    }

    async fn run_tests(&self, args: Vec<Value>) -> Result<Value> {
        self.request("runTests", Value::Array(args)).await
    }

    async fn cancel_run(&self) -> Result<Value> {
        self.request("cancelRun", Value::Array(Vec::new())).await
    }

    async fn get_files(&self) -> Result<Value> {
        self.request("getFiles", Value::Array(Vec::new())).await
    }

    async fn watch_tests(&self, args: Vec<Value>) -> Result<Value> {
        self.request("watchTests", Value::Array(args)).await
    }

    async fn unwatch_tests(&self) -> Result<Value> {
        self.request("unwatchTests", Value::Array(Vec::new())).await
    }

    async fn update_snapshot(&self, args: Vec<Value>) -> Result<Value> {
        self.request("updateSnapshot", Value::Array(args)).await
    }

    async fn dispose(&self) -> Result<()> {
        // Give the host a chance to shut down cleanly, then reap it.
        let _ = self.send(&json!({ "method": "dispose" })).await;
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
        let _ = child.wait().await;
        Ok(())
    }
}

async fn read_host_output(
    stdout: ChildStdout,
    pending: Arc<AsyncMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>,
    events: EventSink,
    project_id: String,
) {
    let mut reader = BufReader::new(stdout).lines();
    let reason = loop {
        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break "engine host process ended".to_string(),
            Err(err) => break format!("failed to read engine host output: {}", err),
        };
        if line.trim().is_empty() {
            continue;
        }

        let message = match serde_json::from_str::<Value>(&line) {
            Ok(value) => value,
            Err(err) => {
                debug!(project = %project_id, error = %err, "discarding non-JSON engine output");
                continue;
            }
        };

        if let Some(id) = message.get("id").and_then(Value::as_u64) {
            if let Some(sender) = pending.lock().await.remove(&id) {
                let outcome = if let Some(error) = message.get("error") {
                    Err(WorkerError::Engine(
                        error
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| error.to_string()),
                    ))
                } else {
                    Ok(message.get("result").cloned().unwrap_or(Value::Null))
                };
                let _ = sender.send(outcome);
            }
            continue;
        }

        if let Some(name) = message.get("event").and_then(Value::as_str) {
            let payload = message.get("payload").cloned().unwrap_or(Value::Null);
            let _ = events.send((
                project_id.clone(),
                EngineEvent {
                    name: name.to_string(),
                    payload,
                },
            ));
        }
    };

    // Fail every in-flight request with the termination reason.
    let waiters: Vec<_> = {
        let mut pending = pending.lock().await;
        pending.drain().map(|(_, sender)| sender).collect()
    };
    if !waiters.is_empty() {
        warn!(project = %project_id, reason = %reason, "engine host terminated with pending requests");
    }
    for waiter in waiters {
        let _ = waiter.send(Err(WorkerError::Engine(reason.clone())));
    }
}
