use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

/// How the engine's companion dev-server layer runs. The bootstrap always
/// forces `Disabled`: no worker may open a listening socket for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiServerMode {
    #[default]
    Disabled,
    Listening,
}

/// Options the bootstrap hands to the engine factory, one per project.
/// The working directory is threaded explicitly; nothing in the worker
/// mutates the process-wide current directory.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub root: PathBuf,
    pub config_file: Option<PathBuf>,
    pub workspace_file: Option<PathBuf>,
    /// Script text for script-derived projects.
    pub arguments: Option<String>,
    pub package_main: Option<PathBuf>,
    pub loader: Option<PathBuf>,
    pub pnp: Option<PathBuf>,
    pub api: ApiServerMode,
}

/// A structured event reported by an engine (task updates, collected
/// files, run completion). The payload shape is the engine's business.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub name: String,
    pub payload: Value,
}

/// Sink for engine events, tagged with the owning project id.
pub type EventSink = mpsc::UnboundedSender<(String, EngineEvent)>;

/// The test-execution engine: an external collaborator. The worker starts
/// it, feeds it configuration, and reads its reported events; collection
/// and run semantics are opaque at this layer.
#[async_trait]
pub trait TestEngine: Send + Sync {
    async fn collect_tests(&self, args: Vec<Value>) -> Result<Value>;
    async fn run_tests(&self, args: Vec<Value>) -> Result<Value>;
    async fn cancel_run(&self) -> Result<Value>;
    async fn get_files(&self) -> Result<Value>;
    async fn watch_tests(&self, args: Vec<Value>) -> Result<Value>;
    async fn unwatch_tests(&self) -> Result<Value>;
    async fn update_snapshot(&self, args: Vec<Value>) -> Result<Value>;
    async fn dispose(&self) -> Result<()>;
}

/// Constructs one engine per project descriptor.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(
        &self,
        options: EngineOptions,
        events: EventSink,
        project_id: &str,
    ) -> Result<Box<dyn TestEngine>>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory engine used by bootstrap and bridge tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::WorkerError;
    use serde_json::json;

    #[derive(Default)]
    pub struct FakeEngine {
        pub disposed: Arc<AtomicUsize>,
        pub fail_dispose: bool,
    }

    #[async_trait]
    impl TestEngine for FakeEngine {
        async fn collect_tests(&self, args: Vec<Value>) -> Result<Value> {
            Ok(json!({ "collected": args }))
        }

        async fn run_tests(&self, args: Vec<Value>) -> Result<Value> {
            Ok(json!({ "ran": args }))
        }

        async fn cancel_run(&self) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn get_files(&self) -> Result<Value> {
            Ok(json!(["a.test.ts"]))
        }

        async fn watch_tests(&self, _args: Vec<Value>) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn unwatch_tests(&self) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn update_snapshot(&self, _args: Vec<Value>) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn dispose(&self) -> Result<()> {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            if self.fail_dispose {
                Err(WorkerError::Engine("dispose failed".to_string()))
            } else {
                Ok(())
            }
        }
    }

    /// Factory that fails construction for ids listed in `failing`.
    #[derive(Default)]
    pub struct FakeFactory {
        pub failing: Vec<String>,
        pub disposed: Arc<AtomicUsize>,
        pub fail_dispose: bool,
    }

    #[async_trait]
    impl EngineFactory for FakeFactory {
        async fn create(
            &self,
            _options: EngineOptions,
            _events: EventSink,
            project_id: &str,
        ) -> Result<Box<dyn TestEngine>> {
            if self.failing.iter().any(|id| id == project_id) {
                return Err(WorkerError::Engine(format!(
                    "engine refused to start for {}",
                    project_id
                )));
            }
            Ok(Box::new(FakeEngine {
                disposed: Arc::clone(&self.disposed),
                fail_dispose: self.fail_dispose,
            }))
        }
    }
}
