//! Plugin registry
//!
//! Owns descriptors and per-plugin state. Lifecycle hooks are run through a
//! [`PluginExecutor`] so the sandbox can wrap them; whatever the hook does,
//! the registry only ever reports `true` or `false`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::plugin::{Plugin, PluginContext};
use crate::{Conflict, Dependency, PluginManifest};
use warden_core::events::{EventBus, PluginEvent, Topic};
use warden_core::{Error, Result};

/// Which hook an execution belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Activate,
    Deactivate,
    ApiCall,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::ApiCall => "api_call",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runs plugin code on behalf of the registry
#[async_trait]
pub trait PluginExecutor: Send + Sync {
    async fn execute(
        &self,
        plugin_id: &str,
        phase: Phase,
        task: BoxFuture<'static, anyhow::Result<bool>>,
    ) -> Result<bool>;
}

/// Awaits the hook in place with no timeout
#[derive(Debug, Default)]
pub struct DirectExecutor;

#[async_trait]
impl PluginExecutor for DirectExecutor {
    async fn execute(
        &self,
        plugin_id: &str,
        _phase: Phase,
        task: BoxFuture<'static, anyhow::Result<bool>>,
    ) -> Result<bool> {
        task.await
            .map_err(|e| Error::PluginFailed(plugin_id.to_string(), e.to_string()))
    }
}

/// Mutable lifecycle record, one per plugin ever registered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginState {
    pub id: String,
    pub active: bool,
    /// `None` until a compatibility check has run
    pub compatible: Option<bool>,
    pub compatibility_reason: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub unregistered: bool,
}

impl PluginState {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            active: false,
            compatible: None,
            compatibility_reason: None,
            registered_at: Utc::now(),
            activated_at: None,
            deactivated_at: None,
            last_error: None,
            unregistered: false,
        }
    }
}

#[derive(Default)]
struct Inner {
    plugins: HashMap<String, Plugin>,
    /// Registration order
    order: Vec<String>,
    states: HashMap<String, PluginState>,
    dependencies: HashMap<String, Vec<Dependency>>,
    conflicts: HashMap<String, Vec<Conflict>>,
}

impl Inner {
    fn rebuild_side_tables(&mut self) {
        self.dependencies = self
            .plugins
            .iter()
            .map(|(id, p)| (id.clone(), p.manifest.dependencies.clone()))
            .collect();
        self.conflicts = self
            .plugins
            .iter()
            .map(|(id, p)| (id.clone(), p.manifest.conflicts.clone()))
            .collect();
    }
}

/// In-memory plugin registry
pub struct Registry {
    inner: RwLock<Inner>,
    executor: Arc<dyn PluginExecutor>,
    bus: Arc<EventBus>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    /// Registry that runs hooks in place
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_executor(bus, Arc::new(DirectExecutor))
    }

    pub fn with_executor(bus: Arc<EventBus>, executor: Arc<dyn PluginExecutor>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            executor,
            bus,
        }
    }

    /// Add or replace a plugin; fails only when the id is missing
    pub async fn register(&self, plugin: Plugin) -> bool {
        let id = plugin.id().trim().to_string();
        if id.is_empty() {
            warn!("Refusing to register plugin without an id");
            return false;
        }

        let version = plugin.manifest.version.clone();
        let overwritten = {
            let mut inner = self.inner.write().await;
            let overwritten = inner.plugins.insert(id.clone(), plugin).is_some();
            if overwritten {
                warn!(plugin_id = %id, "Plugin already registered, overwriting descriptor");
            } else {
                inner.order.push(id.clone());
            }
            let state = inner
                .states
                .entry(id.clone())
                .or_insert_with(|| PluginState::new(&id));
            state.unregistered = false;
            inner.rebuild_side_tables();
            overwritten
        };

        debug!(plugin_id = %id, %version, "Plugin registered");
        self.bus
            .publish(PluginEvent::for_plugin(
                Topic::PluginRegistered,
                &id,
                json!({ "version": version, "overwritten": overwritten }),
            ))
            .await;
        true
    }

    /// Deactivate if needed, then drop the descriptor; the state record stays
    pub async fn unregister(&self, id: &str) -> bool {
        if !self.contains(id).await {
            return false;
        }
        if self.is_active(id).await {
            self.deactivate(id).await;
        }

        {
            let mut inner = self.inner.write().await;
            inner.plugins.remove(id);
            inner.order.retain(|p| p != id);
            if let Some(state) = inner.states.get_mut(id) {
                state.active = false;
                state.unregistered = true;
            }
            inner.rebuild_side_tables();
        }

        info!(plugin_id = %id, "Plugin unregistered");
        self.bus
            .publish(PluginEvent::for_plugin(Topic::PluginUnregistered, id, json!({})))
            .await;
        true
    }

    /// Run the activation hook; never propagates plugin failures
    pub async fn activate(&self, id: &str, ctx: PluginContext) -> bool {
        let plugin = {
            let inner = self.inner.read().await;
            match inner.plugins.get(id) {
                Some(p) => p.clone(),
                None => {
                    warn!(plugin_id = %id, "Cannot activate unknown plugin");
                    return false;
                }
            }
        };
        if self.is_active(id).await {
            return true;
        }

        let hooks = plugin.hooks();
        let task: BoxFuture<'static, anyhow::Result<bool>> =
            Box::pin(async move { hooks.activate(ctx).await });
        let outcome = self.executor.execute(id, Phase::Activate, task).await;

        let error = match outcome {
            Ok(true) => None,
            Ok(false) => Some("activation routine returned false".to_string()),
            Err(e) => Some(e.to_string()),
        };

        {
            let mut inner = self.inner.write().await;
            if let Some(state) = inner.states.get_mut(id) {
                if error.is_none() {
                    state.active = true;
                    state.activated_at = Some(Utc::now());
                    state.last_error = None;
                } else {
                    state.last_error = error.clone();
                }
            }
        }

        match error {
            None => {
                info!(plugin_id = %id, "Plugin activated");
                self.bus
                    .publish(PluginEvent::for_plugin(
                        Topic::PluginActivated,
                        id,
                        json!({ "version": plugin.manifest.version }),
                    ))
                    .await;
                true
            }
            Some(reason) => {
                warn!(plugin_id = %id, %reason, "Plugin activation failed");
                self.bus
                    .publish(PluginEvent::for_plugin(
                        Topic::PluginActivationFailed,
                        id,
                        json!({ "reason": reason }),
                    ))
                    .await;
                false
            }
        }
    }

    /// Run the teardown hook and mark the plugin inactive whatever it does
    ///
    /// Returns `false` when teardown failed.
    pub async fn deactivate(&self, id: &str) -> bool {
        let plugin = {
            let inner = self.inner.read().await;
            match inner.plugins.get(id) {
                Some(p) => p.clone(),
                None => return false,
            }
        };
        if !self.is_active(id).await {
            return true;
        }

        let hooks = plugin.hooks();
        let task: BoxFuture<'static, anyhow::Result<bool>> =
            Box::pin(async move { hooks.deactivate().await });
        let error = match self.executor.execute(id, Phase::Deactivate, task).await {
            Ok(true) => None,
            Ok(false) => Some("deactivation routine returned false".to_string()),
            Err(e) => Some(e.to_string()),
        };

        {
            let mut inner = self.inner.write().await;
            if let Some(state) = inner.states.get_mut(id) {
                state.active = false;
                state.deactivated_at = Some(Utc::now());
                if error.is_some() {
                    state.last_error = error.clone();
                }
            }
        }

        if let Some(reason) = &error {
            warn!(plugin_id = %id, %reason, "Plugin teardown failed; marked inactive anyway");
        } else {
            info!(plugin_id = %id, "Plugin deactivated");
        }
        self.bus
            .publish(PluginEvent::for_plugin(
                Topic::PluginDeactivated,
                id,
                json!({ "clean": error.is_none(), "error": error }),
            ))
            .await;
        error.is_none()
    }

    pub async fn get(&self, id: &str) -> Option<Plugin> {
        self.inner.read().await.plugins.get(id).cloned()
    }

    pub async fn manifest(&self, id: &str) -> Option<PluginManifest> {
        self.inner
            .read()
            .await
            .plugins
            .get(id)
            .map(|p| p.manifest.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.plugins.contains_key(id)
    }

    /// All registered plugins in registration order
    pub async fn all(&self) -> Vec<Plugin> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.plugins.get(id).cloned())
            .collect()
    }

    pub async fn manifests(&self) -> Vec<PluginManifest> {
        self.all().await.into_iter().map(|p| p.manifest).collect()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.read().await.order.clone()
    }

    pub async fn active_ids(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter(|id| inner.states.get(*id).is_some_and(|s| s.active))
            .cloned()
            .collect()
    }

    pub async fn is_active(&self, id: &str) -> bool {
        self.inner
            .read()
            .await
            .states
            .get(id)
            .is_some_and(|s| s.active && !s.unregistered)
    }

    pub async fn state(&self, id: &str) -> Option<PluginState> {
        self.inner.read().await.states.get(id).cloned()
    }

    /// Every state record, including unregistered plugins
    pub async fn states(&self) -> Vec<PluginState> {
        let mut states: Vec<_> = self.inner.read().await.states.values().cloned().collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    pub async fn last_error(&self, id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .states
            .get(id)
            .and_then(|s| s.last_error.clone())
    }

    pub async fn set_error(&self, id: &str, error: impl Into<String>) {
        if let Some(state) = self.inner.write().await.states.get_mut(id) {
            state.last_error = Some(error.into());
        }
    }

    pub async fn set_compatibility(&self, id: &str, compatible: bool, reason: Option<String>) {
        if let Some(state) = self.inner.write().await.states.get_mut(id) {
            state.compatible = Some(compatible);
            state.compatibility_reason = reason;
        }
    }

    pub async fn dependencies_of(&self, id: &str) -> Vec<Dependency> {
        self.inner
            .read()
            .await
            .dependencies
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn conflicts_of(&self, id: &str) -> Vec<Conflict> {
        self.inner
            .read()
            .await
            .conflicts
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Conflict table for every registered plugin
    pub async fn conflict_table(&self) -> HashMap<String, Vec<Conflict>> {
        self.inner.read().await.conflicts.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.plugins.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.plugins.is_empty()
    }
}
