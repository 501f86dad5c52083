use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ProjectDescriptor;

/// One per-project failure as reported by a worker: `[id, detail]`.
/// Top-level failures unrelated to any specific project use an empty id.
pub type ProjectFailure = (String, String);

/// Messages sent controller → worker, one JSON object per line.
///
/// This is a closed protocol: anything that does not decode into one of
/// these variants is a protocol error, never silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerRequest {
    /// Bootstrap command carrying the full project set for this worker,
    /// plus the optional module-loader hook and plug'n'play manifest shared
    /// by the whole process.
    Init {
        meta: Vec<ProjectDescriptor>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        loader: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pnp: Option<PathBuf>,
    },

    /// Remote call. By convention `params[0]` is the target project id for
    /// every method; `close` is the only id-less operation and has its own
    /// variant below.
    Call {
        seq: u64,
        method: String,
        #[serde(default)]
        params: Vec<Value>,
    },

    /// Dispose every execution context and exit.
    Close,
}

/// Messages sent worker → controller, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerReply {
    /// Bootstrap succeeded with at least one live context; `errors` lists
    /// the projects that failed to construct.
    Ready { errors: Vec<ProjectFailure> },

    /// Bootstrap produced zero live contexts.
    Error { errors: Vec<ProjectFailure> },

    /// Outcome of a `call`, matched by `seq`. Exactly one of `ok`/`err`
    /// is set.
    Result {
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ok: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<String>,
    },

    /// A structured event reported by one project's execution engine.
    Event {
        project: String,
        name: String,
        payload: Value,
    },
}

impl WorkerReply {
    pub fn ok(seq: u64, value: Value) -> Self {
        WorkerReply::Result {
            seq,
            ok: Some(value),
            err: None,
        }
    }

    pub fn err(seq: u64, detail: impl Into<String>) -> Self {
        WorkerReply::Result {
            seq,
            ok: None,
            err: Some(detail.into()),
        }
    }
}

/// Encode a message as a single protocol line (no trailing newline).
pub fn encode<T: Serialize>(message: &T) -> serde_json::Result<String> {
    serde_json::to_string(message)
}

pub fn decode_request(line: &str) -> serde_json::Result<WorkerRequest> {
    serde_json::from_str(line)
}

pub fn decode_reply(line: &str) -> serde_json::Result<WorkerReply> {
    serde_json::from_str(line)
}
