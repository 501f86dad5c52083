use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::types::{DiscoverySettings, RunnerVersion, WorkspaceFolder};

/// Oldest vitest release the bridge knows how to drive.
pub const MINIMUM_VITEST_VERSION: (u64, u64, u64) = (0, 34, 0);

const RUNNER_PACKAGE_NAME: &str = "vitest";
const PNP_MANIFEST: &str = ".pnp.cjs";
const PNP_LOADER: &str = ".pnp.loader.mjs";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no vitest package resolvable from {0}")]
    PackageNotFound(PathBuf),

    #[error("package at {path} declares name '{actual}', expected '{RUNNER_PACKAGE_NAME}'")]
    PackageMismatch { path: PathBuf, actual: String },

    #[error("vitest {version} at {path} is below the minimum supported 0.34.0")]
    VersionTooOld { path: PathBuf, version: String },

    #[error("failed to read package manifest {path}: {source}")]
    ManifestUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse package manifest {path}: {source}")]
    ManifestInvalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Plug'n'play sub-record: the loader hook to register and the manager's
/// manifest, both at the workspace folder root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PnpResolution {
    pub loader: PathBuf,
    pub manifest: PathBuf,
}

/// A validated vitest package resolution for one candidate directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageResolution {
    pub package_json: PathBuf,
    /// Runner entry module. In plug'n'play mode no entry is resolvable on
    /// disk, so this points at the pnp manifest and the loader takes over.
    pub main: PathBuf,
    pub version: RunnerVersion,
    pub pnp: Option<PnpResolution>,
}

/// Cache of successful resolutions keyed by manifest path. Every failed
/// validation invalidates its entry so a retry after the user fixes the
/// install re-reads fresh state instead of a stale version.
#[derive(Debug, Default)]
pub struct ResolutionCache {
    entries: HashMap<PathBuf, PackageResolution>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        ResolutionCache::default()
    }

    pub fn get(&self, manifest: &Path) -> Option<&PackageResolution> {
        self.entries.get(manifest)
    }

    pub fn insert(&mut self, manifest: PathBuf, resolution: PackageResolution) {
        self.entries.insert(manifest, resolution);
    }

    /// Drop any cached state for `manifest`. Returns whether an entry existed.
    pub fn invalidate(&mut self, manifest: &Path) -> bool {
        self.entries.remove(manifest).is_some()
    }
}

#[derive(Debug, Deserialize)]
struct PackageManifest {
    name: Option<String>,
    version: Option<String>,
    main: Option<String>,
}

/// Resolve and validate a vitest package for `dir`, scoped to `folder`.
///
/// Returns `None` when nothing resolvable or validation fails; the failure
/// is surfaced at a severity controlled by `show_warning` (interactive
/// discovery warns, background fallback only logs). Package-name mismatches
/// are always error-level.
pub async fn resolve_vitest_package(
    dir: &Path,
    folder: &WorkspaceFolder,
    settings: &DiscoverySettings,
    cache: &Mutex<ResolutionCache>,
    show_warning: bool,
) -> Option<PackageResolution> {
    match try_resolve(dir, folder, settings, cache).await {
        Ok(resolution) => Some(resolution),
        Err(err) => {
            report(&err, show_warning);
            None
        }
    }
}

async fn try_resolve(
    dir: &Path,
    folder: &WorkspaceFolder,
    settings: &DiscoverySettings,
    cache: &Mutex<ResolutionCache>,
) -> Result<PackageResolution, ResolveError> {
    let manifest = match locate_manifest(dir, folder, settings).await {
        Some(path) => path,
        None => {
            if let Some(pnp) = probe_pnp(folder).await {
                return Ok(pnp);
            }
            return Err(ResolveError::PackageNotFound(dir.to_path_buf()));
        }
    };

    if let Some(hit) = cache
        .lock()
        .expect("resolution cache poisoned")
        .get(&manifest)
    {
        debug!(manifest = %manifest.display(), "package resolution cache hit");
        return Ok(hit.clone());
    }

    let resolution = match validate_manifest(&manifest).await {
        Ok(resolution) => resolution,
        Err(err) => {
            cache
                .lock()
                .expect("resolution cache poisoned")
                .invalidate(&manifest);
            return Err(err);
        }
    };

    cache
        .lock()
        .expect("resolution cache poisoned")
        .insert(manifest, resolution.clone());
    Ok(resolution)
}

/// Find the vitest manifest for `dir`: the workspace-level override if set,
/// otherwise `node_modules/vitest/package.json` walking up from `dir` to the
/// folder root (inclusive).
async fn locate_manifest(
    dir: &Path,
    folder: &WorkspaceFolder,
    settings: &DiscoverySettings,
) -> Option<PathBuf> {
    if let Some(pinned) = &settings.package_path {
        return Some(pinned.clone());
    }

    for ancestor in dir.ancestors() {
        let candidate = ancestor
            .join("node_modules")
            .join(RUNNER_PACKAGE_NAME)
            .join("package.json");
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return Some(candidate);
        }
        if ancestor == folder.path {
            break;
        }
    }
    None
}

/// Probe the folder root for zero-install mode: both the pnp manifest and
/// the loader hook must exist.
async fn probe_pnp(folder: &WorkspaceFolder) -> Option<PackageResolution> {
    let manifest = folder.path.join(PNP_MANIFEST);
    let loader = folder.path.join(PNP_LOADER);
    if !tokio::fs::try_exists(&manifest).await.unwrap_or(false)
        || !tokio::fs::try_exists(&loader).await.unwrap_or(false)
    {
        return None;
    }
    debug!(folder = %folder.path.display(), "resolved vitest in plug'n'play mode");
    Some(PackageResolution {
        package_json: manifest.clone(),
        main: manifest.clone(),
        version: RunnerVersion::PlugAndPlay,
        pnp: Some(PnpResolution { loader, manifest }),
    })
}

async fn validate_manifest(manifest: &Path) -> Result<PackageResolution, ResolveError> {
    let content =
        tokio::fs::read_to_string(manifest)
            .await
            .map_err(|source| ResolveError::ManifestUnreadable {
                path: manifest.to_path_buf(),
                source,
            })?;
    let parsed: PackageManifest =
        serde_json::from_str(&content).map_err(|source| ResolveError::ManifestInvalid {
            path: manifest.to_path_buf(),
            source,
        })?;

    let name = parsed.name.unwrap_or_default();
    if name != RUNNER_PACKAGE_NAME {
        return Err(ResolveError::PackageMismatch {
            path: manifest.to_path_buf(),
            actual: name,
        });
    }

    let version = parsed.version.unwrap_or_default();
    match parse_version(&version) {
        Some(parsed_version) if parsed_version >= MINIMUM_VITEST_VERSION => {}
        _ => {
            return Err(ResolveError::VersionTooOld {
                path: manifest.to_path_buf(),
                version,
            });
        }
    }

    let package_dir = manifest.parent().unwrap_or(Path::new("."));
    let entry = parsed.main.as_deref().unwrap_or("index.js");
    let main = package_dir.join(entry.trim_start_matches("./"));

    Ok(PackageResolution {
        package_json: manifest.to_path_buf(),
        main,
        version: RunnerVersion::Version(version),
        pnp: None,
    })
}

/// Parse a semver-ish declaration (`1.2.3`, `^1.0.0`, `2.0.0-beta.1`) into
/// a comparable triple.
fn parse_version(raw: &str) -> Option<(u64, u64, u64)> {
    let core = raw.trim().trim_start_matches(['^', '~', '=', 'v']);
    let core = core.split(['-', '+']).next()?;
    let mut parts = core.split('.');
    let major = parts.next()?.trim().parse().ok()?;
    let minor = parts.next().unwrap_or("0").trim().parse().ok()?;
    let patch = parts.next().unwrap_or("0").trim().parse().ok()?;
    Some((major, minor, patch))
}

fn report(err: &ResolveError, show_warning: bool) {
    match err {
        // A wrong package under the expected name is always an error.
        ResolveError::PackageMismatch { .. } => error!(error = %err, "vitest resolution failed"),
        _ if show_warning => warn!(error = %err, "vitest resolution failed"),
        _ => debug!(error = %err, "vitest resolution failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_manifest(dir: &Path, name: &str, version: &str) -> PathBuf {
        let package_dir = dir.join("node_modules").join("vitest");
        fs::create_dir_all(&package_dir).unwrap();
        let manifest = package_dir.join("package.json");
        fs::write(
            &manifest,
            format!(
                r#"{{ "name": "{}", "version": "{}", "main": "./dist/index.js" }}"#,
                name, version
            ),
        )
        .unwrap();
        manifest
    }

    fn folder(root: &Path) -> WorkspaceFolder {
        WorkspaceFolder::new("test", root)
    }

    #[tokio::test]
    async fn resolves_from_nested_directory() {
        let temp = TempDir::new().unwrap();
        let manifest = write_manifest(temp.path(), "vitest", "1.6.0");
        let nested = temp.path().join("packages").join("app");
        fs::create_dir_all(&nested).unwrap();

        let cache = Mutex::new(ResolutionCache::new());
        let resolution = resolve_vitest_package(
            &nested,
            &folder(temp.path()),
            &DiscoverySettings::default(),
            &cache,
            true,
        )
        .await
        .unwrap();

        assert_eq!(resolution.package_json, manifest);
        assert_eq!(
            resolution.version,
            RunnerVersion::Version("1.6.0".to_string())
        );
        assert!(resolution.main.ends_with("dist/index.js"));
        assert!(resolution.pnp.is_none());
    }

    #[tokio::test]
    async fn walk_stops_at_folder_root() {
        let temp = TempDir::new().unwrap();
        // Install above the workspace folder root; must not be found.
        write_manifest(temp.path(), "vitest", "1.6.0");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).unwrap();

        let cache = Mutex::new(ResolutionCache::new());
        let resolution = resolve_vitest_package(
            &root,
            &folder(&root),
            &DiscoverySettings::default(),
            &cache,
            false,
        )
        .await;
        assert!(resolution.is_none());
    }

    #[tokio::test]
    async fn rejects_mismatched_package_name() {
        let temp = TempDir::new().unwrap();
        write_manifest(temp.path(), "not-vitest", "1.6.0");

        let cache = Mutex::new(ResolutionCache::new());
        let resolution = resolve_vitest_package(
            temp.path(),
            &folder(temp.path()),
            &DiscoverySettings::default(),
            &cache,
            true,
        )
        .await;
        assert!(resolution.is_none());
    }

    #[tokio::test]
    async fn rejects_version_below_minimum() {
        let temp = TempDir::new().unwrap();
        write_manifest(temp.path(), "vitest", "0.33.0");

        let cache = Mutex::new(ResolutionCache::new());
        let resolution = resolve_vitest_package(
            temp.path(),
            &folder(temp.path()),
            &DiscoverySettings::default(),
            &cache,
            true,
        )
        .await;
        assert!(resolution.is_none());
    }

    #[tokio::test]
    async fn retry_after_failed_validation_reads_fresh_state() {
        let temp = TempDir::new().unwrap();
        let manifest = write_manifest(temp.path(), "vitest", "0.10.0");

        let cache = Mutex::new(ResolutionCache::new());
        let settings = DiscoverySettings::default();
        let ws = folder(temp.path());

        assert!(
            resolve_vitest_package(temp.path(), &ws, &settings, &cache, true)
                .await
                .is_none()
        );
        assert!(cache.lock().unwrap().get(&manifest).is_none());

        // The user upgrades; the next pass must see the new version rather
        // than any state left over from the failed attempt.
        write_manifest(temp.path(), "vitest", "1.6.0");
        let resolution = resolve_vitest_package(temp.path(), &ws, &settings, &cache, true)
            .await
            .unwrap();
        assert_eq!(
            resolution.version,
            RunnerVersion::Version("1.6.0".to_string())
        );
    }

    #[test]
    fn invalidate_reports_whether_an_entry_existed() {
        let mut cache = ResolutionCache::new();
        let manifest = PathBuf::from("/work/node_modules/vitest/package.json");
        cache.insert(
            manifest.clone(),
            PackageResolution {
                package_json: manifest.clone(),
                main: manifest.clone(),
                version: RunnerVersion::Version("1.0.0".to_string()),
                pnp: None,
            },
        );
        assert!(cache.invalidate(&manifest));
        assert!(!cache.invalidate(&manifest));
    }

    #[tokio::test]
    async fn cache_hit_skips_re_reading_the_manifest() {
        let temp = TempDir::new().unwrap();
        let manifest = write_manifest(temp.path(), "vitest", "1.6.0");

        let cache = Mutex::new(ResolutionCache::new());
        let settings = DiscoverySettings::default();
        let ws = folder(temp.path());

        let first = resolve_vitest_package(temp.path(), &ws, &settings, &cache, true)
            .await
            .unwrap();
        // Corrupt the manifest on disk; the cached resolution still answers.
        fs::write(&manifest, "not json").unwrap();
        let second = resolve_vitest_package(temp.path(), &ws, &settings, &cache, true)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn package_path_override_pins_the_manifest() {
        let temp = TempDir::new().unwrap();
        let pinned_dir = temp.path().join("custom");
        fs::create_dir_all(&pinned_dir).unwrap();
        let pinned = pinned_dir.join("package.json");
        fs::write(
            &pinned,
            r#"{ "name": "vitest", "version": "2.0.0", "main": "./dist/index.js" }"#,
        )
        .unwrap();

        let settings = DiscoverySettings {
            package_path: Some(pinned.clone()),
            ..DiscoverySettings::default()
        };
        let cache = Mutex::new(ResolutionCache::new());
        let resolution = resolve_vitest_package(
            temp.path(),
            &folder(temp.path()),
            &settings,
            &cache,
            true,
        )
        .await
        .unwrap();
        assert_eq!(resolution.package_json, pinned);
    }

    #[tokio::test]
    async fn falls_back_to_plug_and_play() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(".pnp.cjs"), "// pnp manifest").unwrap();
        fs::write(temp.path().join(".pnp.loader.mjs"), "// loader").unwrap();

        let cache = Mutex::new(ResolutionCache::new());
        let resolution = resolve_vitest_package(
            temp.path(),
            &folder(temp.path()),
            &DiscoverySettings::default(),
            &cache,
            true,
        )
        .await
        .unwrap();

        assert_eq!(resolution.version, RunnerVersion::PlugAndPlay);
        let pnp = resolution.pnp.unwrap();
        assert!(pnp.loader.ends_with(".pnp.loader.mjs"));
        assert!(pnp.manifest.ends_with(".pnp.cjs"));
    }

    #[tokio::test]
    async fn pnp_requires_the_loader_hook() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(".pnp.cjs"), "// pnp manifest").unwrap();

        let cache = Mutex::new(ResolutionCache::new());
        let resolution = resolve_vitest_package(
            temp.path(),
            &folder(temp.path()),
            &DiscoverySettings::default(),
            &cache,
            false,
        )
        .await;
        assert!(resolution.is_none());
    }

    #[test]
    fn version_parsing_accepts_range_prefixes_and_prereleases() {
        assert_eq!(parse_version("1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_version("^0.34.0"), Some((0, 34, 0)));
        assert_eq!(parse_version("~1.0"), Some((1, 0, 0)));
        assert_eq!(parse_version("2.0.0-beta.1"), Some((2, 0, 0)));
        assert_eq!(parse_version("v3.1.4"), Some((3, 1, 4)));
        assert_eq!(parse_version("not-a-version"), None);
    }
}
