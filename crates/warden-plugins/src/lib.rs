//! Warden Plugin System
//!
//! Governs extension code running inside a host application:
//! - Plugin registry and lifecycle
//! - Compatibility checks and dependency-ordered activation
//! - Permission approval, resource quotas and static analysis gating
//! - Timeout-wrapped execution and an auditable trail of decisions
//!
//! None of this is an isolation boundary. Plugin code runs in the host
//! process; the sandbox can stop waiting for a plugin but cannot stop it.

pub mod api;
pub mod audit;
pub mod compatibility;
pub mod loader;
pub mod manager;
pub mod permissions;
pub mod plugin;
pub mod registry;
pub mod resolver;
pub mod resources;
pub mod sandbox;
pub mod security;

#[cfg(test)]
mod test_support;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use warden_core::Error as PluginError;
pub type PluginResult<T> = warden_core::Result<T>;

pub use api::HostApi;
pub use manager::{PluginManager, PluginManagerBuilder};
pub use plugin::{ApiCall, ApiHandler, Plugin, PluginContext, PluginHooks, PublicMethod, api_handler};

/// Declared dependency on another plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: String,
    /// Minimum acceptable version; any version satisfies when absent
    #[serde(default)]
    pub min_version: Option<String>,
}

/// Declared conflict with another plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    #[serde(default)]
    pub reason: String,
}

/// Plugin manifest (immutable descriptor)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub author: String,
    #[serde(default)]
    pub min_app_version: Option<String>,
    #[serde(default)]
    pub max_app_version: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    /// Requested permission names
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Explicit load priority (lower loads earlier)
    #[serde(default)]
    pub priority: Option<u32>,
    /// Self-identified core plugin
    #[serde(default)]
    pub core: bool,
    /// Script payload subject to static analysis
    #[serde(default)]
    pub code: Option<String>,
}

impl PluginManifest {
    /// Minimal manifest; name defaults to the id
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: version.into(),
            description: String::new(),
            author: "unknown".to_string(),
            min_app_version: None,
            max_app_version: None,
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            permissions: Vec::new(),
            priority: None,
            core: false,
            code: None,
        }
    }

    pub fn with_app_range(mut self, min: impl Into<String>, max: impl Into<String>) -> Self {
        self.min_app_version = Some(min.into());
        self.max_app_version = Some(max.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>, min_version: Option<&str>) -> Self {
        self.dependencies.push(Dependency {
            id: id.into(),
            min_version: min_version.map(String::from),
        });
        self
    }

    pub fn conflicts_with(mut self, id: impl Into<String>, reason: impl Into<String>) -> Self {
        self.conflicts.push(Conflict {
            id: id.into(),
            reason: reason.into(),
        });
        self
    }

    pub fn with_permissions(mut self, permissions: &[&str]) -> Self {
        self.permissions = permissions.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn core(mut self) -> Self {
        self.core = true;
        self
    }

    /// Parsed semantic version, if valid
    pub fn semver(&self) -> Option<semver::Version> {
        semver::Version::parse(&self.version).ok()
    }

    pub fn dependency_ids(&self) -> Vec<String> {
        self.dependencies.iter().map(|d| d.id.clone()).collect()
    }
}

/// Structural validation run before registration
pub fn validate_manifest(manifest: &PluginManifest) -> PluginResult<()> {
    if manifest.id.trim().is_empty()
        || manifest.name.trim().is_empty()
        || manifest.author.trim().is_empty()
    {
        return Err(PluginError::InvalidDescriptor(
            "Manifest id, name and author cannot be empty".to_string(),
        ));
    }

    if manifest.semver().is_none() {
        return Err(PluginError::InvalidDescriptor(format!(
            "Version '{}' of '{}' is not a semantic version",
            manifest.version, manifest.id
        )));
    }

    for bound in [&manifest.min_app_version, &manifest.max_app_version]
        .into_iter()
        .flatten()
    {
        if semver::Version::parse(bound).is_err() {
            return Err(PluginError::InvalidDescriptor(format!(
                "App version bound '{}' of '{}' is not a semantic version",
                bound, manifest.id
            )));
        }
    }

    for dep in &manifest.dependencies {
        if dep.id == manifest.id {
            return Err(PluginError::InvalidDescriptor(format!(
                "Plugin '{}' cannot depend on itself",
                manifest.id
            )));
        }
        if let Some(min) = &dep.min_version {
            if semver::Version::parse(min).is_err() {
                return Err(PluginError::InvalidDescriptor(format!(
                    "Dependency '{}' of '{}' has invalid minimum version '{}'",
                    dep.id, manifest.id, min
                )));
            }
        }
    }

    let mut seen = HashSet::new();
    for permission in &manifest.permissions {
        if !seen.insert(permission) {
            return Err(PluginError::InvalidDescriptor(
                "Duplicate permissions are not allowed".to_string(),
            ));
        }
    }

    Ok(())
}
