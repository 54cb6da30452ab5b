//! Compatibility checker
//!
//! Four independent checks against the registry: host version range,
//! dependency satisfaction, forward conflicts and reverse conflicts. Only
//! *active* plugins count as conflicting.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::PluginManifest;
use crate::registry::Registry;
use warden_core::events::{EventBus, PluginEvent, Topic};
use warden_core::{Error, Result};

/// Outcome of a single check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: bool,
    pub reason: Option<String>,
    /// Offending ids or itemized misses
    #[serde(default)]
    pub items: Vec<String>,
}

impl CheckOutcome {
    fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
            items: Vec::new(),
        }
    }

    fn fail(reason: impl Into<String>, items: Vec<String>) -> Self {
        Self {
            passed: false,
            reason: Some(reason.into()),
            items,
        }
    }
}

/// Combined verdict for one plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityResult {
    pub plugin_id: String,
    pub compatible: bool,
    pub reason: Option<String>,
    pub app_version: CheckOutcome,
    pub dependencies: CheckOutcome,
    pub conflicts: CheckOutcome,
    pub reverse_conflicts: CheckOutcome,
    pub checked_at: DateTime<Utc>,
}

pub struct CompatibilityChecker {
    registry: Arc<Registry>,
    bus: Arc<EventBus>,
    app_version: Version,
    cache: RwLock<HashMap<String, CompatibilityResult>>,
}

impl CompatibilityChecker {
    pub fn new(registry: Arc<Registry>, bus: Arc<EventBus>, app_version: Version) -> Self {
        Self {
            registry,
            bus,
            app_version,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn app_version(&self) -> &Version {
        &self.app_version
    }

    /// Host version must fall inside `[min_app_version, max_app_version]`
    pub fn check_app_version(&self, manifest: &PluginManifest) -> CheckOutcome {
        let (Some(min), Some(max)) = (&manifest.min_app_version, &manifest.max_app_version) else {
            return CheckOutcome::fail("Missing app version requirements", Vec::new());
        };

        let (Ok(min), Ok(max)) = (Version::parse(min), Version::parse(max)) else {
            return CheckOutcome::fail("Unparsable app version requirements", Vec::new());
        };

        if self.app_version < min {
            CheckOutcome::fail(
                format!("Requires app version >= {}, running {}", min, self.app_version),
                Vec::new(),
            )
        } else if self.app_version > max {
            CheckOutcome::fail(
                format!("Requires app version <= {}, running {}", max, self.app_version),
                Vec::new(),
            )
        } else {
            CheckOutcome::pass()
        }
    }

    /// Every dependency must be registered at or above its minimum version
    pub async fn check_dependencies(&self, manifest: &PluginManifest) -> CheckOutcome {
        let mut missing = Vec::new();

        for dep in &manifest.dependencies {
            let Some(target) = self.registry.manifest(&dep.id).await else {
                missing.push(format!("{} (not registered)", dep.id));
                continue;
            };

            let Some(min) = &dep.min_version else {
                continue;
            };
            match (target.semver(), Version::parse(min)) {
                (Some(found), Ok(required)) if found >= required => {}
                (Some(found), Ok(required)) => missing.push(format!(
                    "{} (requires >= {}, found {})",
                    dep.id, required, found
                )),
                _ => missing.push(format!("{} (unparsable version)", dep.id)),
            }
        }

        if missing.is_empty() {
            CheckOutcome::pass()
        } else {
            CheckOutcome::fail(format!("Missing dependencies: {}", missing.join(", ")), missing)
        }
    }

    /// No active plugin may appear in this plugin's conflict list
    pub async fn check_conflicts(&self, manifest: &PluginManifest) -> CheckOutcome {
        let mut conflicting = Vec::new();
        for conflict in &manifest.conflicts {
            if self.registry.is_active(&conflict.id).await {
                conflicting.push(conflict.id.clone());
            }
        }

        if conflicting.is_empty() {
            CheckOutcome::pass()
        } else {
            CheckOutcome::fail(
                format!("Conflicts with active plugins: {}", conflicting.join(", ")),
                conflicting,
            )
        }
    }

    /// No active plugin may declare this plugin as a conflict
    pub async fn check_reverse_conflicts(&self, plugin_id: &str) -> CheckOutcome {
        let mut declaring = Vec::new();
        for (other, conflicts) in self.registry.conflict_table().await {
            if other == plugin_id || !conflicts.iter().any(|c| c.id == plugin_id) {
                continue;
            }
            if self.registry.is_active(&other).await {
                declaring.push(other);
            }
        }
        declaring.sort();

        if declaring.is_empty() {
            CheckOutcome::pass()
        } else {
            CheckOutcome::fail(
                format!("Active plugins declare a conflict: {}", declaring.join(", ")),
                declaring,
            )
        }
    }

    /// Run all four checks, cache the verdict and publish it
    pub async fn run_full_check(&self, plugin_id: &str) -> Result<CompatibilityResult> {
        let manifest = self
            .registry
            .manifest(plugin_id)
            .await
            .ok_or_else(|| Error::PluginNotFound(plugin_id.to_string()))?;

        let app_version = self.check_app_version(&manifest);
        let dependencies = self.check_dependencies(&manifest).await;
        let conflicts = self.check_conflicts(&manifest).await;
        let reverse_conflicts = self.check_reverse_conflicts(plugin_id).await;

        let compatible = app_version.passed
            && dependencies.passed
            && conflicts.passed
            && reverse_conflicts.passed;
        let reason = [&app_version, &dependencies, &conflicts, &reverse_conflicts]
            .into_iter()
            .find_map(|c| c.reason.clone());

        let result = CompatibilityResult {
            plugin_id: plugin_id.to_string(),
            compatible,
            reason,
            app_version,
            dependencies,
            conflicts,
            reverse_conflicts,
            checked_at: Utc::now(),
        };

        debug!(plugin_id = %plugin_id, compatible, "Compatibility checked");
        self.cache
            .write()
            .await
            .insert(plugin_id.to_string(), result.clone());
        self.registry
            .set_compatibility(plugin_id, compatible, result.reason.clone())
            .await;
        self.bus
            .publish(PluginEvent::for_plugin(
                Topic::CompatibilityChecked,
                plugin_id,
                json!({ "compatible": compatible, "reason": result.reason }),
            ))
            .await;

        Ok(result)
    }

    /// Check every registered plugin
    pub async fn check_all(&self) -> Vec<CompatibilityResult> {
        let mut results = Vec::new();
        for id in self.registry.ids().await {
            if let Ok(result) = self.run_full_check(&id).await {
                results.push(result);
            }
        }
        results
    }

    pub async fn cached(&self, plugin_id: &str) -> Option<CompatibilityResult> {
        self.cache.read().await.get(plugin_id).cloned()
    }

    pub async fn invalidate(&self, plugin_id: &str) {
        self.cache.write().await.remove(plugin_id);
    }

    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }
}
