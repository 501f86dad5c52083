use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A root folder of the multi-folder workspace. One worker process is
/// spawned per folder; every discovered project belongs to exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceFolder {
    pub name: String,
    pub path: PathBuf,
}

impl WorkspaceFolder {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        WorkspaceFolder {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Resolved runner version: a concrete semver string, or the sentinel for
/// zero-install (plug'n'play) resolution where no manifest is readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunnerVersion {
    Version(String),
    PlugAndPlay,
}

impl fmt::Display for RunnerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerVersion::Version(v) => write!(f, "{}", v),
            RunnerVersion::PlugAndPlay => write!(f, "pnp"),
        }
    }
}

/// One runnable Vitest configuration.
///
/// `id` is globally unique across a discovery pass: the normalized absolute
/// path of the config file, or `<manifest path>/<script name>` for projects
/// discovered from package.json scripts. It is the map key everywhere
/// downstream, including RPC dispatch inside workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDescriptor {
    pub folder: WorkspaceFolder,

    /// Human display label. Not unique until [`crate::deduplicate_prefixes`]
    /// has run over the full discovered set.
    pub prefix: String,

    pub id: String,

    /// Working directory for the execution context.
    pub cwd: PathBuf,

    pub version: RunnerVersion,

    /// Resolved runner entry module, handed to the worker so the engine
    /// host can be launched without re-resolving.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_main: Option<PathBuf>,

    /// Full script text for script-derived projects (extra CLI arguments).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,

    /// Set iff this project is a member of a workspace-level config file.
    /// In that case `config_file` carries the shared root-config override,
    /// never the project's own file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_file: Option<PathBuf>,

    /// Module-loader hook, registered once per worker process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loader: Option<PathBuf>,

    /// Plug'n'play manifest path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnp: Option<PathBuf>,
}

/// Caller-supplied discovery settings. The overrides pin a single
/// workspace-config or root-config path, bypassing the scan for that tier;
/// `package_path` pins the vitest manifest itself.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySettings {
    pub workspace_config: Option<PathBuf>,
    pub root_config: Option<PathBuf>,
    pub package_path: Option<PathBuf>,
    /// Directory names excluded from every scan, matched per path component.
    pub exclude: Vec<String>,
}

impl DiscoverySettings {
    pub fn with_default_excludes() -> Self {
        DiscoverySettings {
            exclude: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            ..DiscoverySettings::default()
        }
    }
}

pub const DEFAULT_EXCLUDES: &[&str] = &["node_modules", ".git", "dist", "coverage"];
