//! Plugin discovery
//!
//! A [`PluginSource`] supplies plugins to the manager at initialization.
//! [`StaticSource`] hands over plugins built in code; [`ManifestDirSource`]
//! reads JSON manifests from a plugin directory and yields declarative
//! plugins.

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::plugin::Plugin;
use crate::{PluginError, PluginManifest, PluginResult, validate_manifest};

const MAX_MANIFEST_BYTES: u64 = 64 * 1024;

/// Where plugins come from
#[async_trait]
pub trait PluginSource: Send + Sync {
    async fn discover(&self) -> PluginResult<Vec<Plugin>>;
}

/// Plugins constructed by the host
#[derive(Debug, Default, Clone)]
pub struct StaticSource {
    plugins: Vec<Plugin>,
}

impl StaticSource {
    pub fn new(plugins: Vec<Plugin>) -> Self {
        Self { plugins }
    }
}

#[async_trait]
impl PluginSource for StaticSource {
    async fn discover(&self) -> PluginResult<Vec<Plugin>> {
        Ok(self.plugins.clone())
    }
}

/// `*.json` manifests in one directory
///
/// Invalid manifests are skipped with a warning rather than failing the scan.
#[derive(Debug, Clone)]
pub struct ManifestDirSource {
    dir: Option<PathBuf>,
}

impl ManifestDirSource {
    /// Scan `dir`, or the default plugin directory when `None`
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    fn base_dir(&self) -> PluginResult<PathBuf> {
        let base = match &self.dir {
            Some(dir) => dir.clone(),
            None => default_plugin_dir()?,
        };
        fs::create_dir_all(&base)?;
        Ok(base.canonicalize().unwrap_or(base))
    }
}

#[async_trait]
impl PluginSource for ManifestDirSource {
    async fn discover(&self) -> PluginResult<Vec<Plugin>> {
        let base = self.base_dir()?;

        let mut paths: Vec<PathBuf> = fs::read_dir(&base)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut plugins = Vec::with_capacity(paths.len());
        for path in paths {
            match load_manifest(&base, &path) {
                Ok(manifest) => {
                    debug!(plugin_id = %manifest.id, path = %path.display(), "Discovered plugin manifest");
                    plugins.push(Plugin::declarative(manifest));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping plugin manifest"),
            }
        }
        Ok(plugins)
    }
}

/// `WARDEN_PLUGIN_DIR`, else `~/.warden/plugins`
pub fn default_plugin_dir() -> PluginResult<PathBuf> {
    if let Ok(path) = std::env::var("WARDEN_PLUGIN_DIR") {
        return Ok(PathBuf::from(path));
    }
    dirs::home_dir()
        .map(|home| home.join(".warden").join("plugins"))
        .ok_or_else(|| PluginError::ConfigError("Unable to resolve plugin directory".to_string()))
}

/// Read and validate one manifest that must live under `base`
pub fn load_manifest(base: &Path, path: &Path) -> PluginResult<PluginManifest> {
    let canonical = resolve_manifest_path(base, path)?;

    let metadata = fs::metadata(&canonical)?;
    if metadata.len() > MAX_MANIFEST_BYTES {
        return Err(PluginError::InvalidDescriptor(format!(
            "Manifest {} is too large ({} bytes)",
            path.display(),
            metadata.len()
        )));
    }

    let data = fs::read_to_string(&canonical)?;
    let manifest: PluginManifest = serde_json::from_str(&data)
        .map_err(|e| PluginError::InvalidDescriptor(format!("Invalid manifest JSON: {e}")))?;

    validate_manifest(&manifest)?;
    Ok(manifest)
}

fn resolve_manifest_path(base: &Path, path: &Path) -> PluginResult<PathBuf> {
    let link = fs::symlink_metadata(path)?;
    if link.file_type().is_symlink() {
        return Err(PluginError::InvalidDescriptor(format!(
            "Manifest {} is a symlink",
            path.display()
        )));
    }
    if !link.file_type().is_file() {
        return Err(PluginError::InvalidDescriptor(format!(
            "Manifest {} is not a regular file",
            path.display()
        )));
    }

    let canonical = path.canonicalize()?;
    if !canonical.starts_with(base) {
        return Err(PluginError::InvalidDescriptor(format!(
            "Manifest {:?} must reside under {:?}",
            canonical, base
        )));
    }
    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, value: serde_json::Value) {
        fs::write(dir.join(name), serde_json::to_vec(&value).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_discovers_valid_manifests_in_name_order() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "b.json",
            json!({ "id": "beta", "name": "Beta", "version": "1.0.0", "author": "a" }),
        );
        write(
            dir.path(),
            "a.json",
            json!({
                "id": "alpha",
                "name": "Alpha",
                "version": "0.2.0",
                "author": "a",
                "dependencies": [{ "id": "beta", "min_version": "1.0.0" }],
                "permissions": ["ui"]
            }),
        );
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = ManifestDirSource::new(Some(dir.path().to_path_buf()));
        let plugins = source.discover().await.unwrap();
        let ids: Vec<&str> = plugins.iter().map(|p| p.id()).collect();

        assert_eq!(ids, vec!["alpha", "beta"]);
        assert_eq!(plugins[0].manifest.dependency_ids(), vec!["beta".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_manifests_are_skipped() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "bad-version.json", json!({ "id": "x", "name": "X", "version": "one", "author": "a" }));
        write(dir.path(), "missing-author.json", json!({ "id": "y", "name": "Y", "version": "1.0.0" }));
        fs::write(dir.path().join("garbage.json"), "{ not json").unwrap();
        fs::write(dir.path().join("huge.json"), vec![b' '; (MAX_MANIFEST_BYTES + 1) as usize]).unwrap();
        write(dir.path(), "ok.json", json!({ "id": "ok", "name": "Ok", "version": "1.0.0", "author": "a" }));

        let plugins = ManifestDirSource::new(Some(dir.path().to_path_buf()))
            .discover()
            .await
            .unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].id(), "ok");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_manifest_is_refused() {
        let outside = TempDir::new().unwrap();
        write(outside.path(), "real.json", json!({ "id": "s", "name": "S", "version": "1.0.0", "author": "a" }));
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path().join("real.json"), dir.path().join("link.json")).unwrap();

        let base = dir.path().canonicalize().unwrap();
        assert!(load_manifest(&base, &dir.path().join("link.json")).is_err());
        let plugins = ManifestDirSource::new(Some(dir.path().to_path_buf()))
            .discover()
            .await
            .unwrap();
        assert!(plugins.is_empty());
    }

    #[tokio::test]
    async fn test_manifest_outside_base_is_refused() {
        let base = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        write(other.path(), "p.json", json!({ "id": "p", "name": "P", "version": "1.0.0", "author": "a" }));

        let canonical = base.path().canonicalize().unwrap();
        assert!(load_manifest(&canonical, &other.path().join("p.json")).is_err());
    }

    #[tokio::test]
    async fn test_static_source_returns_its_plugins() {
        let source = StaticSource::new(vec![Plugin::declarative(PluginManifest::new("s", "1.0.0"))]);
        assert_eq!(source.discover().await.unwrap().len(), 1);
    }
}
