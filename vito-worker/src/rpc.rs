use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::context::ExecutionContext;
use crate::error::{Result, WorkerError};

/// Id-first dispatch across every execution context a worker hosts: the
/// first call parameter names the target project, which lets one worker
/// transparently multiplex calls across all projects it hosts.
pub struct RpcBridge {
    contexts: HashMap<String, ExecutionContext>,
}

impl RpcBridge {
    pub fn new(contexts: HashMap<String, ExecutionContext>) -> Self {
        RpcBridge { contexts }
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Dispatch a call: `params[0]` must be a known project id; the rest
    /// are forwarded to the context's method registry.
    pub async fn dispatch(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let mut params = params.into_iter();
        let id = match params.next() {
            Some(Value::String(id)) => id,
            other => {
                return Err(WorkerError::Protocol(format!(
                    "call to '{}' carried no project id (first param: {:?})",
                    method, other
                )))
            }
        };

        let context = self
            .contexts
            .get(&id)
            .ok_or(WorkerError::InstanceNotFound(id))?;
        context.dispatch(method, params.collect()).await
    }

    /// Dispose every context, best-effort: one disposal failure never
    /// blocks the others.
    pub async fn close(&self) {
        for (id, context) in &self.contexts {
            if let Err(err) = context.dispose().await {
                warn!(id = %id, error = %err, "context disposal failed");
            }
        }
    }
}
