use serde_json::Value;

use crate::engine::TestEngine;
use crate::error::{Result, WorkerError};

/// One execution context per project: a live engine plus the explicit
/// method registry the RPC bridge dispatches through.
pub struct ExecutionContext {
    id: String,
    engine: Box<dyn TestEngine>,
}

impl ExecutionContext {
    pub fn new(id: String, engine: Box<dyn TestEngine>) -> Self {
        ExecutionContext { id, engine }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Method name → typed engine call. New capabilities are added to the
    /// [`TestEngine`] trait and this registry; everything else falls
    /// through to the single `MethodNotFound` branch.
    pub async fn dispatch(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        match method {
            "collectTests" => self.engine.collect_tests(args).await,
            "runTests" => self.engine.run_tests(args).await,
            "cancelRun" => self.engine.cancel_run().await,
            "getFiles" => self.engine.get_files().await,
            "watchTests" => self.engine.watch_tests(args).await,
            "unwatchTests" => self.engine.unwatch_tests().await,
            "updateSnapshot" => self.engine.update_snapshot(args).await,
            other => Err(WorkerError::MethodNotFound(other.to_string())),
        }
    }

    pub async fn dispose(&self) -> Result<()> {
        self.engine.dispose().await
    }
}
