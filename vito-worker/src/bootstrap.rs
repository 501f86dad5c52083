use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{error, info, warn};

use vito_data::protocol::{ProjectFailure, WorkerReply};
use vito_data::ProjectDescriptor;

use crate::context::ExecutionContext;
use crate::engine::{ApiServerMode, EngineFactory, EngineOptions, EventSink};
use crate::error::WorkerError;
use crate::state::{validate_transition, WorkerState};

/// Outcome of one bootstrap attempt. The worker replies exactly once with
/// either `ready` (partial failures allowed) or `error` (nothing lives).
pub struct Bootstrap {
    pub state: WorkerState,
    pub contexts: HashMap<String, ExecutionContext>,
    pub errors: Vec<ProjectFailure>,
}

impl Bootstrap {
    pub fn reply(&self) -> WorkerReply {
        match self.state {
            WorkerState::Ready => WorkerReply::Ready {
                errors: self.errors.clone(),
            },
            _ => WorkerReply::Error {
                errors: self.errors.clone(),
            },
        }
    }
}

/// Initialize one execution context per descriptor, strictly sequentially
/// in descriptor order. A single construction failure is collected and the
/// remaining siblings still initialize.
pub async fn initialize(
    factory: &dyn EngineFactory,
    meta: Vec<ProjectDescriptor>,
    loader: Option<PathBuf>,
    pnp: Option<PathBuf>,
    events: EventSink,
) -> Bootstrap {
    let mut state = WorkerState::Spawned;
    transition(&mut state, WorkerState::Initializing);

    let mut contexts: HashMap<String, ExecutionContext> = HashMap::new();
    let mut errors: Vec<ProjectFailure> = Vec::new();

    if meta.is_empty() {
        // Top-level failure unrelated to any specific project.
        errors.push((String::new(), "no projects to initialize".to_string()));
    }

    for descriptor in meta {
        let options = EngineOptions {
            root: descriptor.cwd.clone(),
            config_file: descriptor.config_file.clone(),
            workspace_file: descriptor.workspace_file.clone(),
            arguments: descriptor.arguments.clone(),
            package_main: descriptor.package_main.clone(),
            // The worker-wide hook wins; per-project values are the
            // fallback for mixed sets.
            loader: loader.clone().or_else(|| descriptor.loader.clone()),
            pnp: pnp.clone().or_else(|| descriptor.pnp.clone()),
            api: ApiServerMode::Disabled,
        };

        match factory.create(options, events.clone(), &descriptor.id).await {
            Ok(engine) => {
                info!(id = %descriptor.id, prefix = %descriptor.prefix, "execution context initialized");
                contexts.insert(
                    descriptor.id.clone(),
                    ExecutionContext::new(descriptor.id, engine),
                );
            }
            Err(err) => {
                let failure = WorkerError::ConstructionFailed {
                    id: descriptor.id.clone(),
                    detail: err.to_string(),
                };
                warn!(error = %failure, "execution context failed to construct");
                errors.push((descriptor.id, failure.to_string()));
            }
        }
    }

    let settled = if contexts.is_empty() {
        WorkerState::Errored
    } else {
        WorkerState::Ready
    };
    transition(&mut state, settled);

    Bootstrap {
        state,
        contexts,
        errors,
    }
}

fn transition(state: &mut WorkerState, to: WorkerState) {
    if let Err(err) = validate_transition(*state, to) {
        // A violation here is a worker bug; record it loudly but keep the
        // process alive so the reply still goes out.
        error!(error = %err, "worker state machine violation");
    }
    *state = to;
}
