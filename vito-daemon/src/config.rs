use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use vito_data::types::DEFAULT_EXCLUDES;
use vito_data::{DiscoverySettings, WorkspaceFolder};

/// Daemon configuration loaded from file and/or environment.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Workspace folder roots, in precedence order.
    pub workspace: Vec<PathBuf>,
    /// Directory names excluded from discovery scans.
    pub exclude: Vec<String>,
    /// Pins a single workspace-config file, bypassing the scan.
    pub workspace_config: Option<PathBuf>,
    /// Pins a single root-config file, bypassing the scan.
    pub root_config: Option<PathBuf>,
    /// Pins the vitest package manifest itself.
    pub package_path: Option<PathBuf>,
    pub worker_bin: PathBuf,
    /// Engine host binary, forwarded to every worker.
    pub engine_bin: Option<PathBuf>,
}

/// Raw TOML file structure for `~/.config/vito/config.toml`.
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    workspace: Option<Vec<PathBuf>>,
    exclude: Option<Vec<String>>,
    workspace_config: Option<PathBuf>,
    root_config: Option<PathBuf>,
    package_path: Option<PathBuf>,
    worker_bin: Option<PathBuf>,
    engine_bin: Option<PathBuf>,
}

/// Default config file location.
fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vito")
        .join("config.toml")
}

impl DaemonConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Priority: environment variables override file values. The file path
    /// can be overridden by `config_path`.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let path = config_path.cloned().unwrap_or_else(default_config_path);

        let file_config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            toml::from_str::<ConfigFile>(&content)
                .with_context(|| format!("failed to parse config: {}", path.display()))?
        } else {
            ConfigFile::default()
        };

        Self::from_file_and_env(file_config)
    }

    /// Build config from parsed file values and current environment.
    fn from_file_and_env(file_config: ConfigFile) -> Result<Self> {
        let ConfigFile {
            workspace,
            exclude,
            workspace_config,
            root_config,
            package_path,
            worker_bin,
            engine_bin,
        } = file_config;

        let resolved_workspace = std::env::var_os("VITO_WORKSPACE")
            .map(|raw| std::env::split_paths(&raw).collect::<Vec<_>>())
            .filter(|folders| !folders.is_empty())
            .or(workspace);
        let resolved_worker_bin = std::env::var_os("VITO_WORKER_BIN")
            .map(PathBuf::from)
            .or(worker_bin);
        let resolved_engine_bin = std::env::var_os("VITO_ENGINE_BIN")
            .map(PathBuf::from)
            .or(engine_bin);

        Self::build(
            resolved_workspace,
            exclude,
            workspace_config,
            root_config,
            package_path,
            resolved_worker_bin,
            resolved_engine_bin,
        )
    }

    /// Build config from resolved option values (after file + env merging).
    #[allow(clippy::too_many_arguments)]
    fn build(
        workspace: Option<Vec<PathBuf>>,
        exclude: Option<Vec<String>>,
        workspace_config: Option<PathBuf>,
        root_config: Option<PathBuf>,
        package_path: Option<PathBuf>,
        worker_bin: Option<PathBuf>,
        engine_bin: Option<PathBuf>,
    ) -> Result<Self> {
        let workspace = match workspace {
            Some(folders) if !folders.is_empty() => folders,
            _ => vec![std::env::current_dir().context("could not determine working directory")?],
        };
        for folder in &workspace {
            if !folder.is_absolute() {
                bail!("workspace folder must be absolute: {}", folder.display());
            }
        }

        let exclude = exclude.unwrap_or_else(|| {
            DEFAULT_EXCLUDES.iter().map(|name| name.to_string()).collect()
        });

        Ok(DaemonConfig {
            workspace,
            exclude,
            workspace_config,
            root_config,
            package_path,
            worker_bin: worker_bin.unwrap_or_else(|| PathBuf::from("vito-worker")),
            engine_bin,
        })
    }

    /// Workspace folders with display names derived from the directory name.
    pub fn folders(&self) -> Vec<WorkspaceFolder> {
        self.workspace
            .iter()
            .map(|path| {
                let name = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or("workspace")
                    .to_string();
                WorkspaceFolder::new(name, path.clone())
            })
            .collect()
    }

    pub fn settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            workspace_config: self.workspace_config.clone(),
            root_config: self.root_config.clone(),
            package_path: self.package_path.clone(),
            exclude: self.exclude.clone(),
        }
    }
}
