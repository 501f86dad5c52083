//! Workspace discovery: which runnable Vitest projects exist.
//!
//! Two strategies run under a single gating policy: config-file discovery
//! first, and manifest-script discovery only as a fallback when the first
//! strategy produced nothing *and* raised no validation warning. A single
//! misconfigured project must never silently swap config-based discovery
//! for script-based discovery.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use futures::future::join_all;
use serde::Deserialize;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::prefix::deduplicate_prefixes;
use crate::resolver::{resolve_vitest_package, PackageResolution, ResolutionCache};
use crate::types::{DiscoverySettings, ProjectDescriptor, WorkspaceFolder};

/// Script commands qualify on an exact prefix match including the trailing
/// space: `"vitest run"` counts, a bare `"vitest"` or `"vitest-custom run"`
/// does not.
const SCRIPT_PREFIX: &str = "vitest ";

const CONFIG_EXTENSIONS: &[&str] = &["ts", "js", "mts", "mjs", "cts", "cjs"];

/// Outcome of one discovery strategy (or of the whole pass).
#[derive(Debug, Default)]
pub struct DiscoveredProjects {
    pub projects: Vec<ProjectDescriptor>,
    /// Set when any candidate failed package resolution or validation.
    pub warned: bool,
}

/// Full discovery pass: config files, then the manifest-script fallback,
/// then prefix deduplication over whichever set won.
pub async fn resolve_vitest_packages(
    folders: &[WorkspaceFolder],
    settings: &DiscoverySettings,
    cache: &Mutex<ResolutionCache>,
    show_warning: bool,
) -> DiscoveredProjects {
    let mut discovered = resolve_vitest_configs(folders, settings, cache, show_warning).await;
    if discovered.projects.is_empty() && !discovered.warned {
        debug!("no vitest configs discovered, falling back to manifest scripts");
        discovered = resolve_vitest_manifest_scripts(folders, settings, cache, show_warning).await;
    }
    deduplicate_prefixes(&mut discovered.projects);
    info!(
        projects = discovered.projects.len(),
        warned = discovered.warned,
        "discovery pass complete"
    );
    discovered
}

/// Strategy (a): workspace-config files, else root config files.
pub async fn resolve_vitest_configs(
    folders: &[WorkspaceFolder],
    settings: &DiscoverySettings,
    cache: &Mutex<ResolutionCache>,
    show_warning: bool,
) -> DiscoveredProjects {
    let workspace_candidates = match &settings.workspace_config {
        Some(pinned) => vec![(owning_folder(folders, pinned), pinned.clone())],
        None => scan_folders(folders, &settings.exclude, is_workspace_config_file).await,
    };

    if !workspace_candidates.is_empty() {
        return resolve_candidates(workspace_candidates, settings, cache, show_warning, |folder, file, package| {
            workspace_descriptor(folder, file, settings.root_config.clone(), package)
        })
        .await;
    }

    let root_candidates = match &settings.root_config {
        Some(pinned) => vec![(owning_folder(folders, pinned), pinned.clone())],
        None => scan_folders(folders, &settings.exclude, is_config_file).await,
    };
    let survivors = apply_directory_override(root_candidates);
    resolve_candidates(survivors, settings, cache, show_warning, |folder, file, package| {
        config_descriptor(folder, file, package)
    })
    .await
}

/// Strategy (b): projects embedded as `vitest ...` scripts in package.json
/// manifests. Fallback only; the caller gates it.
pub async fn resolve_vitest_manifest_scripts(
    folders: &[WorkspaceFolder],
    settings: &DiscoverySettings,
    cache: &Mutex<ResolutionCache>,
    show_warning: bool,
) -> DiscoveredProjects {
    let manifests = scan_folders(folders, &settings.exclude, |name| name == "package.json").await;

    let results = join_all(manifests.into_iter().map(|(folder, manifest)| async move {
        manifest_script_projects(folder, manifest, settings, cache, show_warning).await
    }))
    .await;

    let mut discovered = DiscoveredProjects::default();
    for (projects, warned) in results {
        discovered.projects.extend(projects);
        discovered.warned |= warned;
    }
    discovered
}

#[derive(Debug, Deserialize)]
struct ManifestScripts {
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

async fn manifest_script_projects(
    folder: WorkspaceFolder,
    manifest: PathBuf,
    settings: &DiscoverySettings,
    cache: &Mutex<ResolutionCache>,
    show_warning: bool,
) -> (Vec<ProjectDescriptor>, bool) {
    let content = match tokio::fs::read_to_string(&manifest).await {
        Ok(content) => content,
        Err(err) => {
            debug!(manifest = %manifest.display(), error = %err, "skipping unreadable manifest");
            return (Vec::new(), false);
        }
    };
    let parsed: ManifestScripts = match serde_json::from_str(&content) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(manifest = %manifest.display(), error = %err, "skipping unparsable manifest");
            return (Vec::new(), false);
        }
    };

    let matching: Vec<(String, String)> = parsed
        .scripts
        .into_iter()
        .filter(|(_, command)| command.starts_with(SCRIPT_PREFIX))
        .collect();
    if matching.is_empty() {
        return (Vec::new(), false);
    }

    let dir = manifest
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| folder.path.clone());

    // One resolution per manifest; a failure skips every script in it
    // rather than emitting a partial set.
    let Some(package) = resolve_vitest_package(&dir, &folder, settings, cache, show_warning).await
    else {
        return (Vec::new(), true);
    };

    let manifest_id = normalize_path(&manifest);
    let projects = matching
        .into_iter()
        .map(|(name, command)| ProjectDescriptor {
            folder: folder.clone(),
            prefix: name.clone(),
            id: format!("{}/{}", manifest_id.to_string_lossy(), name),
            cwd: dir.clone(),
            version: package.version.clone(),
            package_main: Some(package.main.clone()),
            arguments: Some(command),
            config_file: None,
            workspace_file: None,
            loader: package.pnp.as_ref().map(|pnp| pnp.loader.clone()),
            pnp: package.pnp.as_ref().map(|pnp| pnp.manifest.clone()),
        })
        .collect();
    (projects, false)
}

/// Resolve every candidate concurrently and gather the results; failures
/// mark the pass as warned without aborting the siblings.
async fn resolve_candidates<F>(
    candidates: Vec<(WorkspaceFolder, PathBuf)>,
    settings: &DiscoverySettings,
    cache: &Mutex<ResolutionCache>,
    show_warning: bool,
    build: F,
) -> DiscoveredProjects
where
    F: Fn(WorkspaceFolder, &Path, &PackageResolution) -> ProjectDescriptor,
{
    let results = join_all(candidates.into_iter().map(|(folder, file)| async move {
        let dir = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| folder.path.clone());
        let package = resolve_vitest_package(&dir, &folder, settings, cache, show_warning).await;
        (folder, file, package)
    }))
    .await;

    let mut discovered = DiscoveredProjects::default();
    for (folder, file, package) in results {
        match package {
            Some(package) => discovered.projects.push(build(folder, &file, &package)),
            None => discovered.warned = true,
        }
    }
    discovered
}

fn config_descriptor(
    folder: WorkspaceFolder,
    file: &Path,
    package: &PackageResolution,
) -> ProjectDescriptor {
    let file = normalize_path(file);
    ProjectDescriptor {
        prefix: file_basename(&file),
        id: file.to_string_lossy().into_owned(),
        cwd: file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| folder.path.clone()),
        version: package.version.clone(),
        package_main: Some(package.main.clone()),
        arguments: None,
        config_file: Some(file),
        workspace_file: None,
        loader: package.pnp.as_ref().map(|pnp| pnp.loader.clone()),
        pnp: package.pnp.as_ref().map(|pnp| pnp.manifest.clone()),
        folder,
    }
}

fn workspace_descriptor(
    folder: WorkspaceFolder,
    file: &Path,
    root_config: Option<PathBuf>,
    package: &PackageResolution,
) -> ProjectDescriptor {
    let file = normalize_path(file);
    ProjectDescriptor {
        prefix: file_basename(&file),
        id: file.to_string_lossy().into_owned(),
        cwd: file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| folder.path.clone()),
        version: package.version.clone(),
        package_main: Some(package.main.clone()),
        arguments: None,
        // Members of a workspace file inherit the shared root-config
        // override, never a file of their own.
        config_file: root_config,
        workspace_file: Some(file),
        loader: package.pnp.as_ref().map(|pnp| pnp.loader.clone()),
        pnp: package.pnp.as_ref().map(|pnp| pnp.manifest.clone()),
        folder,
    }
}

/// Within one directory a vitest config shadows build-tool (vite) configs.
/// The complete per-directory candidate set is grouped before any filtering
/// so the shadowing check never observes a partial set.
fn apply_directory_override(
    candidates: Vec<(WorkspaceFolder, PathBuf)>,
) -> Vec<(WorkspaceFolder, PathBuf)> {
    let mut by_dir: BTreeMap<PathBuf, Vec<(WorkspaceFolder, PathBuf)>> = BTreeMap::new();
    for (folder, file) in candidates {
        let dir = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        by_dir.entry(dir).or_default().push((folder, file));
    }

    let mut survivors = Vec::new();
    for (_, group) in by_dir {
        let has_runner_config = group
            .iter()
            .any(|(_, file)| name_matches(file, is_runner_config_file));
        for (folder, file) in group {
            if has_runner_config && name_matches(&file, is_build_tool_config_file) {
                debug!(config = %file.display(), "build-tool config shadowed by a vitest config");
                continue;
            }
            survivors.push((folder, file));
        }
    }
    survivors
}

/// Walk every folder (in parallel, blocking walks off the runtime) and
/// collect files whose basename satisfies `matches`. Results are sorted per
/// folder for deterministic discovery order.
async fn scan_folders(
    folders: &[WorkspaceFolder],
    exclude: &[String],
    matches: fn(&str) -> bool,
) -> Vec<(WorkspaceFolder, PathBuf)> {
    let scans = folders.iter().map(|folder| {
        let folder = folder.clone();
        let exclude = exclude.to_vec();
        async move {
            let root = folder.path.clone();
            let files = tokio::task::spawn_blocking(move || walk(&root, &exclude, matches))
                .await
                .unwrap_or_default();
            files
                .into_iter()
                .map(|file| (folder.clone(), file))
                .collect::<Vec<_>>()
        }
    });
    join_all(scans).await.into_iter().flatten().collect()
}

fn walk(root: &Path, exclude: &[String], matches: fn(&str) -> bool) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter();
    for entry in walker.filter_entry(|entry| {
        !(entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .map(|name| exclude.iter().any(|excluded| excluded == name))
                .unwrap_or(false))
    }) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if matches(name) {
            found.push(entry.into_path());
        }
    }
    found.sort();
    found
}

fn owning_folder(folders: &[WorkspaceFolder], path: &Path) -> WorkspaceFolder {
    folders
        .iter()
        .find(|folder| path.starts_with(&folder.path))
        .or_else(|| folders.first())
        .cloned()
        .unwrap_or_else(|| WorkspaceFolder::new("workspace", path.parent().unwrap_or(path)))
}

fn name_matches(file: &Path, matches: fn(&str) -> bool) -> bool {
    file.file_name()
        .and_then(|name| name.to_str())
        .map(matches)
        .unwrap_or(false)
}

fn file_basename(file: &Path) -> String {
    file.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_string()
}

fn has_config_extension(name: &str) -> bool {
    CONFIG_EXTENSIONS
        .iter()
        .any(|ext| name.rsplit('.').next() == Some(*ext))
}

fn is_workspace_config_file(name: &str) -> bool {
    match name.strip_prefix("vitest.workspace.") {
        Some(ext) => matches!(ext, "ts" | "js" | "mts" | "mjs" | "cts" | "cjs" | "json"),
        None => false,
    }
}

fn is_runner_config_file(name: &str) -> bool {
    name.contains("vitest.config.") && has_config_extension(name)
}

fn is_build_tool_config_file(name: &str) -> bool {
    name.contains("vite.config.") && has_config_extension(name)
}

fn is_config_file(name: &str) -> bool {
    is_runner_config_file(name) || is_build_tool_config_file(name)
}

/// Normalize a path without touching the filesystem: strips `.` and
/// resolves `..` components so ids compare stably.
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn install_vitest(root: &Path, version: &str) {
        let package_dir = root.join("node_modules").join("vitest");
        fs::create_dir_all(&package_dir).unwrap();
        fs::write(
            package_dir.join("package.json"),
            format!(
                r#"{{ "name": "vitest", "version": "{}", "main": "./dist/index.js" }}"#,
                version
            ),
        )
        .unwrap();
    }

    fn folders(root: &Path) -> Vec<WorkspaceFolder> {
        vec![WorkspaceFolder::new("workspace", root)]
    }

    fn settings() -> DiscoverySettings {
        DiscoverySettings::with_default_excludes()
    }

    async fn discover(root: &Path, settings: &DiscoverySettings) -> DiscoveredProjects {
        let cache = Mutex::new(ResolutionCache::new());
        resolve_vitest_packages(&folders(root), settings, &cache, true).await
    }

    #[tokio::test]
    async fn vitest_config_shadows_vite_config_in_the_same_directory() {
        let temp = TempDir::new().unwrap();
        install_vitest(temp.path(), "1.6.0");
        fs::write(temp.path().join("vite.config.ts"), "").unwrap();
        fs::write(temp.path().join("vitest.config.ts"), "").unwrap();

        let discovered = discover(temp.path(), &settings()).await;
        assert_eq!(discovered.projects.len(), 1);
        assert!(discovered.projects[0].id.ends_with("vitest.config.ts"));
        assert!(!discovered.warned);
    }

    #[tokio::test]
    async fn vite_config_alone_is_a_project() {
        let temp = TempDir::new().unwrap();
        install_vitest(temp.path(), "1.6.0");
        fs::write(temp.path().join("vite.config.ts"), "").unwrap();

        let discovered = discover(temp.path(), &settings()).await;
        assert_eq!(discovered.projects.len(), 1);
        assert!(discovered.projects[0].id.ends_with("vite.config.ts"));
    }

    #[tokio::test]
    async fn multiple_vitest_configs_in_one_directory_all_survive() {
        let temp = TempDir::new().unwrap();
        install_vitest(temp.path(), "1.6.0");
        fs::write(temp.path().join("vitest.config.ts"), "").unwrap();
        fs::write(temp.path().join("vitest.config.e2e.ts"), "").unwrap();

        let discovered = discover(temp.path(), &settings()).await;
        assert_eq!(discovered.projects.len(), 2);
    }

    #[tokio::test]
    async fn configs_under_excluded_directories_are_ignored() {
        let temp = TempDir::new().unwrap();
        install_vitest(temp.path(), "1.6.0");
        let buried = temp.path().join("node_modules").join("dep");
        fs::create_dir_all(&buried).unwrap();
        fs::write(buried.join("vitest.config.ts"), "").unwrap();

        let discovered = discover(temp.path(), &settings()).await;
        assert!(discovered.projects.is_empty());
        assert!(!discovered.warned);
    }

    #[tokio::test]
    async fn workspace_config_wins_over_plain_configs() {
        let temp = TempDir::new().unwrap();
        install_vitest(temp.path(), "1.6.0");
        fs::write(temp.path().join("vitest.workspace.ts"), "").unwrap();
        let nested = temp.path().join("packages").join("app");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("vitest.config.ts"), "").unwrap();

        let discovered = discover(temp.path(), &settings()).await;
        assert_eq!(discovered.projects.len(), 1);
        let project = &discovered.projects[0];
        assert!(project
            .workspace_file
            .as_ref()
            .unwrap()
            .ends_with("vitest.workspace.ts"));
        assert!(project.config_file.is_none());
    }

    #[tokio::test]
    async fn workspace_members_inherit_the_root_config_override() {
        let temp = TempDir::new().unwrap();
        install_vitest(temp.path(), "1.6.0");
        fs::write(temp.path().join("vitest.workspace.ts"), "").unwrap();

        let root_config = temp.path().join("vitest.shared.ts");
        let settings = DiscoverySettings {
            root_config: Some(root_config.clone()),
            ..settings()
        };
        let discovered = discover(temp.path(), &settings).await;
        assert_eq!(discovered.projects.len(), 1);
        assert_eq!(
            discovered.projects[0].config_file.as_ref().unwrap(),
            &root_config
        );
    }

    #[tokio::test]
    async fn pinned_workspace_config_bypasses_the_scan() {
        let temp = TempDir::new().unwrap();
        install_vitest(temp.path(), "1.6.0");
        let pinned = temp.path().join("configs").join("vitest.workspace.json");
        fs::create_dir_all(pinned.parent().unwrap()).unwrap();
        fs::write(&pinned, "[]").unwrap();
        // A scanable workspace file elsewhere must not be considered.
        fs::write(temp.path().join("vitest.workspace.ts"), "").unwrap();

        let settings = DiscoverySettings {
            workspace_config: Some(pinned.clone()),
            ..settings()
        };
        let discovered = discover(temp.path(), &settings).await;
        assert_eq!(discovered.projects.len(), 1);
        assert_eq!(
            discovered.projects[0].workspace_file.as_ref().unwrap(),
            &pinned
        );
    }

    #[tokio::test]
    async fn scripts_are_a_fallback_when_no_configs_exist() {
        let temp = TempDir::new().unwrap();
        install_vitest(temp.path(), "1.6.0");
        fs::write(
            temp.path().join("package.json"),
            r#"{ "name": "app", "scripts": {
                "test": "vitest run",
                "pretest": "vitest --silent run",
                "bare": "vitest",
                "custom": "vitest-custom run",
                "lint": "eslint ."
            } }"#,
        )
        .unwrap();

        let discovered = discover(temp.path(), &settings()).await;
        let mut prefixes: Vec<_> = discovered
            .projects
            .iter()
            .map(|p| p.prefix.as_str())
            .collect();
        prefixes.sort();
        assert_eq!(prefixes, vec!["pretest", "test"]);

        let test_project = discovered
            .projects
            .iter()
            .find(|p| p.prefix == "test")
            .unwrap();
        assert!(test_project.id.ends_with("package.json/test"));
        assert_eq!(test_project.arguments.as_deref(), Some("vitest run"));
        assert!(test_project.config_file.is_none());
    }

    #[tokio::test]
    async fn scripts_never_run_when_a_config_was_found() {
        let temp = TempDir::new().unwrap();
        install_vitest(temp.path(), "1.6.0");
        fs::write(temp.path().join("vitest.config.ts"), "").unwrap();
        fs::write(
            temp.path().join("package.json"),
            r#"{ "scripts": { "test": "vitest run" } }"#,
        )
        .unwrap();

        let discovered = discover(temp.path(), &settings()).await;
        assert_eq!(discovered.projects.len(), 1);
        assert!(discovered.projects[0].id.ends_with("vitest.config.ts"));
    }

    #[tokio::test]
    async fn scripts_never_run_when_config_discovery_warned() {
        let temp = TempDir::new().unwrap();
        // Too old: config discovery warns and yields nothing.
        install_vitest(temp.path(), "0.20.0");
        fs::write(temp.path().join("vitest.config.ts"), "").unwrap();
        fs::write(
            temp.path().join("package.json"),
            r#"{ "scripts": { "test": "vitest run" } }"#,
        )
        .unwrap();

        let discovered = discover(temp.path(), &settings()).await;
        assert!(discovered.projects.is_empty());
        assert!(discovered.warned);
    }

    #[tokio::test]
    async fn manifest_with_failing_package_skips_all_its_scripts() {
        let temp = TempDir::new().unwrap();
        // No vitest install anywhere: the only manifest fails resolution.
        fs::write(
            temp.path().join("package.json"),
            r#"{ "scripts": { "test": "vitest run", "unit": "vitest unit" } }"#,
        )
        .unwrap();

        let discovered = discover(temp.path(), &settings()).await;
        assert!(discovered.projects.is_empty());
        assert!(discovered.warned);
    }

    #[tokio::test]
    async fn duplicate_basenames_get_disambiguated_prefixes() {
        let temp = TempDir::new().unwrap();
        install_vitest(temp.path(), "1.6.0");
        for name in ["proj1", "proj2"] {
            let dir = temp.path().join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("vitest.config.ts"), "").unwrap();
        }

        let discovered = discover(temp.path(), &settings()).await;
        let mut prefixes: Vec<_> = discovered
            .projects
            .iter()
            .map(|p| p.prefix.clone())
            .collect();
        prefixes.sort();
        assert_eq!(
            prefixes,
            vec!["proj1:vitest.config.ts", "proj2:vitest.config.ts"]
        );
    }

    #[tokio::test]
    async fn ids_are_unique_across_the_discovered_set() {
        let temp = TempDir::new().unwrap();
        install_vitest(temp.path(), "1.6.0");
        for name in ["a", "b", "c"] {
            let dir = temp.path().join(name);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("vitest.config.ts"), "").unwrap();
        }

        let discovered = discover(temp.path(), &settings()).await;
        let mut ids: Vec<_> = discovered.projects.iter().map(|p| p.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn config_file_matchers() {
        assert!(is_runner_config_file("vitest.config.ts"));
        assert!(is_runner_config_file("vitest.config.e2e.mts"));
        assert!(!is_runner_config_file("vitest.config.md"));
        assert!(is_build_tool_config_file("vite.config.js"));
        assert!(!is_build_tool_config_file("vitest.config.js"));
        assert!(is_workspace_config_file("vitest.workspace.json"));
        assert!(!is_workspace_config_file("vitest.workspace.yaml"));
    }

    #[test]
    fn normalize_strips_dot_segments() {
        assert_eq!(
            normalize_path(Path::new("/a/./b/../c/vitest.config.ts")),
            PathBuf::from("/a/c/vitest.config.ts")
        );
    }
}
