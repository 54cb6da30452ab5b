//! Plugin manager
//!
//! Composes the registry, resolver, compatibility checker and the security
//! pipeline into the management API a host drives.
//!
//! # Startup
//!
//! 1. Core host API registration
//! 2. Security subsystem (one shared level pushed to every component)
//! 3. Persisted plugin states
//! 4. Discovery and registration
//! 5. Compatibility check of the full set
//! 6. Re-activation of previously active plugins in load order

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::HostApi;
use crate::audit::{AuditEntry, AuditFilter, AuditLog};
use crate::compatibility::{CompatibilityChecker, CompatibilityResult};
use crate::loader::{PluginSource, StaticSource};
use crate::permissions::{PermissionChecker, PermissionRecord, PermissionRequest};
use crate::plugin::{ApiCall, Plugin, PluginContext, api_handler};
use crate::registry::{PluginExecutor, Registry};
use crate::resolver::{DependencyResolver, LoadOrder, PluginValidation};
use crate::resources::{OperationKind, ResourceMonitor};
use crate::sandbox::Sandbox;
use crate::security::{SecurityAction, SecurityManager, SecurityStats};
use crate::validate_manifest;
use warden_core::config::WardenConfig;
use warden_core::events::{EventBus, PluginEvent, Topic};
use warden_core::policy::{AuditMode, SecurityLevel};
use warden_core::storage::{KeyValueStore, MemoryStore, PLUGIN_STATES_KEY};
use warden_core::{Error, Result};

/// One row of [`PluginManager::list_plugins`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub active: bool,
    pub compatible: Option<bool>,
    pub compatibility_reason: Option<String>,
    pub blacklisted: bool,
    pub restricted: bool,
    pub security_score: u32,
    pub priority: u32,
    pub dependencies: Vec<String>,
    pub permissions: PermissionRecord,
    pub last_error: Option<String>,
}

/// Outcome of [`PluginManager::reload`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSummary {
    /// Previously active plugins active again
    pub restored: Vec<String>,
    /// Previously active plugins that could not be re-activated
    pub lost: Vec<String>,
}

pub struct PluginManagerBuilder {
    config: WardenConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    sources: Vec<Box<dyn PluginSource>>,
    plugins: Vec<Plugin>,
}

impl PluginManagerBuilder {
    pub fn new(config: WardenConfig) -> Self {
        Self {
            config,
            store: None,
            sources: Vec::new(),
            plugins: Vec::new(),
        }
    }

    /// Storage collaborator; an in-memory store when unset
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn source(mut self, source: impl PluginSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Add a compiled-in plugin
    pub fn plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Wire every component; nothing is loaded until [`PluginManager::initialize`]
    pub async fn build(self) -> Result<PluginManager> {
        let config = self.config;
        let app_version = semver::Version::parse(&config.host.app_version).map_err(|e| {
            Error::ConfigError(format!(
                "host.app_version '{}' is not a semantic version: {}",
                config.host.app_version, e
            ))
        })?;
        let store: Arc<dyn KeyValueStore> = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let bus = Arc::new(EventBus::new());
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();

        let permissions = Arc::new(PermissionChecker::new(store.clone(), bus.clone(), &config));
        let resources =
            Arc::new(ResourceMonitor::new(bus.clone(), &config).with_actions(actions_tx.clone()));
        let sandbox = Arc::new(Sandbox::new(bus.clone(), &config));
        let audit = Arc::new(AuditLog::new(store.clone(), &config));
        let security = Arc::new(SecurityManager::new(
            &config,
            store.clone(),
            bus.clone(),
            permissions.clone(),
            resources.clone(),
            sandbox.clone(),
            audit.clone(),
            actions_tx,
        ));

        let executor: Arc<dyn PluginExecutor> = sandbox.clone();
        let registry = Arc::new(Registry::with_executor(bus.clone(), executor));
        let compatibility = Arc::new(CompatibilityChecker::new(
            registry.clone(),
            bus.clone(),
            app_version,
        ));
        let resolver = DependencyResolver::new(registry.clone(), compatibility.clone());
        let api = Arc::new(
            HostApi::new(permissions.clone(), resources.clone(), bus.clone())
                .with_sandbox(sandbox.clone()),
        );

        bus.subscribe(&audit).await;
        bus.subscribe(&security).await;

        let mut sources = self.sources;
        if !self.plugins.is_empty() {
            sources.insert(0, Box::new(StaticSource::new(self.plugins)));
        }

        Ok(PluginManager {
            config,
            store,
            bus,
            registry,
            compatibility,
            resolver,
            permissions,
            resources,
            sandbox,
            audit,
            security,
            api,
            sources,
            actions: Mutex::new(actions_rx),
            activating: Mutex::new(HashSet::new()),
            persisted: RwLock::new(BTreeMap::new()),
            initialized: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

pub struct PluginManager {
    config: WardenConfig,
    store: Arc<dyn KeyValueStore>,
    bus: Arc<EventBus>,
    registry: Arc<Registry>,
    compatibility: Arc<CompatibilityChecker>,
    resolver: DependencyResolver,
    permissions: Arc<PermissionChecker>,
    resources: Arc<ResourceMonitor>,
    sandbox: Arc<Sandbox>,
    audit: Arc<AuditLog>,
    security: Arc<SecurityManager>,
    api: Arc<HostApi>,
    sources: Vec<Box<dyn PluginSource>>,
    actions: Mutex<mpsc::UnboundedReceiver<SecurityAction>>,
    /// Ids mid-activation
    activating: Mutex<HashSet<String>>,
    /// Last persisted id -> active map
    persisted: RwLock<BTreeMap<String, bool>>,
    initialized: AtomicBool,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

fn arg_str(args: &Value, name: &str) -> anyhow::Result<String> {
    args.get(name)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| anyhow::anyhow!("missing string argument '{}'", name))
}

fn plugin_data_key(caller: &str, key: &str) -> String {
    format!("plugin_data.{}.{}", caller, key)
}

impl PluginManager {
    pub fn builder(config: WardenConfig) -> PluginManagerBuilder {
        PluginManagerBuilder::new(config)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn compatibility(&self) -> &Arc<CompatibilityChecker> {
        &self.compatibility
    }

    pub fn permissions(&self) -> &Arc<PermissionChecker> {
        &self.permissions
    }

    pub fn resources(&self) -> &Arc<ResourceMonitor> {
        &self.resources
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn security(&self) -> &Arc<SecurityManager> {
        &self.security
    }

    pub fn api(&self) -> &Arc<HostApi> {
        &self.api
    }

    /// Run the startup sequence; a second call is a no-op
    pub async fn initialize(&self) -> Result<()> {
        if self.is_initialized() {
            debug!("Plugin manager already initialized");
            return Ok(());
        }

        self.register_core_api()?;

        self.security.init().await?;
        self.audit.load().await?;
        self.sandbox.harden(&self.api).await;

        self.load_persisted_states().await?;
        let registered = self.discover().await?;
        self.compatibility.check_all().await;
        self.initialized.store(true, Ordering::SeqCst);

        {
            let mut tasks = self.tasks.lock().await;
            tasks.push(self.resources.spawn_reset_loop(self.shutdown.child_token()));
            tasks.push(self.audit.spawn_flush_loop(self.shutdown.child_token()));
        }

        let previously_active: Vec<String> = self
            .persisted
            .read()
            .await
            .iter()
            .filter(|(_, active)| **active)
            .map(|(id, _)| id.clone())
            .collect();
        let restored = self.reactivate(&previously_active).await;

        info!(
            registered,
            reactivated = restored.restored.len(),
            level = %self.security.security_level().await,
            "Plugin manager initialized"
        );
        Ok(())
    }

    fn register_core_api(&self) -> Result<()> {
        let store = self.store.clone();
        self.api.register_core(
            "storage.get",
            api_handler(move |call: ApiCall| {
                let store = store.clone();
                async move {
                    let key = arg_str(&call.args, "key")?;
                    let value = store.get(&plugin_data_key(&call.caller, &key)).await?;
                    Ok(value.unwrap_or(Value::Null))
                }
            }),
        )?;

        let store = self.store.clone();
        self.api.register_core(
            "storage.set",
            api_handler(move |call: ApiCall| {
                let store = store.clone();
                async move {
                    let key = arg_str(&call.args, "key")?;
                    let value = call.args.get("value").cloned().unwrap_or(Value::Null);
                    store.set(&plugin_data_key(&call.caller, &key), value).await?;
                    Ok(Value::Bool(true))
                }
            }),
        )?;

        let store = self.store.clone();
        self.api.register_core(
            "storage.remove",
            api_handler(move |call: ApiCall| {
                let store = store.clone();
                async move {
                    let key = arg_str(&call.args, "key")?;
                    store.remove(&plugin_data_key(&call.caller, &key)).await?;
                    Ok(Value::Bool(true))
                }
            }),
        )?;

        let bus = self.bus.clone();
        self.api.register_core(
            "events.publish",
            api_handler(move |call: ApiCall| {
                let bus = bus.clone();
                async move {
                    let name = arg_str(&call.args, "event")?;
                    let data = call.args.get("data").cloned().unwrap_or(Value::Null);
                    bus.publish(PluginEvent::for_plugin(
                        Topic::PluginMessage,
                        &call.caller,
                        json!({ "event": name, "data": data }),
                    ))
                    .await;
                    Ok(Value::Bool(true))
                }
            }),
        )?;

        self.api.register_core(
            "ui.notify",
            api_handler(|call: ApiCall| async move {
                let message = arg_str(&call.args, "message")?;
                info!(plugin_id = %call.caller, %message, "Plugin notification");
                Ok(Value::Bool(true))
            }),
        )?;

        let config = self.config.clone();
        self.api.register_core(
            "settings.read",
            api_handler(move |call: ApiCall| {
                let config = config.clone();
                async move {
                    let key = arg_str(&call.args, "key")?;
                    Ok(Value::String(config.get(&key)?))
                }
            }),
        )?;

        debug!(methods = self.api.methods().len(), "Core host API registered");
        Ok(())
    }

    async fn load_persisted_states(&self) -> Result<()> {
        let Some(value) = self.store.get(PLUGIN_STATES_KEY).await? else {
            return Ok(());
        };
        match serde_json::from_value::<BTreeMap<String, bool>>(value) {
            Ok(states) => *self.persisted.write().await = states,
            Err(e) => warn!(error = %e, "Ignoring unreadable plugin states"),
        }
        Ok(())
    }

    /// Register every valid plugin the sources yield; returns how many
    async fn discover(&self) -> Result<usize> {
        let mut registered = 0;
        for source in &self.sources {
            for plugin in source.discover().await? {
                if let Err(e) = validate_manifest(&plugin.manifest) {
                    warn!(plugin_id = %plugin.id(), error = %e, "Rejected plugin descriptor");
                    continue;
                }
                if self.registry.register(plugin).await {
                    registered += 1;
                }
            }
        }
        Ok(registered)
    }

    /// Activate `ids` in load order, skipping incompatible or blacklisted ones
    async fn reactivate(&self, ids: &[String]) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let order = self.resolver.build_graph().await.order_ids(ids);
        for id in order {
            let eligible = match self.registry.state(&id).await {
                Some(state) => {
                    !state.unregistered
                        && state.compatible == Some(true)
                        && !self.security.is_blacklisted(&id).await
                }
                None => false,
            };
            if eligible && self.activate_plugin(&id).await {
                summary.restored.push(id);
            } else {
                debug!(plugin_id = %id, "Previously active plugin not restored");
                summary.lost.push(id);
            }
        }
        summary
    }

    async fn persist_states(&self) -> bool {
        let states = self.registry.states().await;
        let snapshot = {
            let mut persisted = self.persisted.write().await;
            for state in states {
                if state.unregistered {
                    persisted.remove(&state.id);
                } else {
                    persisted.insert(state.id, state.active);
                }
            }
            persisted.clone()
        };
        let value = match serde_json::to_value(&snapshot) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to serialize plugin states");
                return false;
            }
        };
        match self.store.set(PLUGIN_STATES_KEY, value).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to persist plugin states");
                false
            }
        }
    }

    /// Activate a plugin and its dependencies; logs and returns `false` on refusal
    pub async fn activate_plugin(&self, id: &str) -> bool {
        match self.try_activate_plugin(id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(plugin_id = %id, error = %e, "Plugin not activated");
                false
            }
        }
    }

    /// Activate a plugin and its dependencies, reporting why on refusal
    pub async fn try_activate_plugin(&self, id: &str) -> Result<()> {
        self.ensure_initialized()?;
        let result = self.activate_guarded(id).await;
        self.process_security_actions().await;
        result
    }

    fn activate_guarded<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !self.registry.contains(id).await {
                return Err(Error::PluginNotFound(id.to_string()));
            }
            if self.registry.is_active(id).await {
                return Ok(());
            }
            if !self.activating.lock().await.insert(id.to_string()) {
                debug!(plugin_id = %id, "Activation already in progress");
                return Ok(());
            }

            let result = self.activate_checked(id).await;
            self.activating.lock().await.remove(id);

            if let Err(e) = &result {
                if !e.is_plugin_fault() {
                    self.registry.set_error(id, e.to_string()).await;
                }
            }
            result
        })
    }

    async fn activate_checked(&self, id: &str) -> Result<()> {
        let plugin = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| Error::PluginNotFound(id.to_string()))?;

        if self.security.is_blacklisted(id).await {
            return Err(Error::Blacklisted(id.to_string()));
        }

        if self.security.checks().await.compatibility {
            let verdict = match self.compatibility.cached(id).await {
                Some(cached) => cached,
                None => self.compatibility.run_full_check(id).await?,
            };
            if !verdict.compatible {
                return Err(Error::Incompatible(
                    id.to_string(),
                    verdict.reason.unwrap_or_else(|| "incompatible".to_string()),
                ));
            }
        }

        self.security.validate_plugin(&plugin.manifest).await?;

        for dependency in &plugin.manifest.dependencies {
            if let Err(e) = self.activate_guarded(&dependency.id).await {
                warn!(plugin_id = %id, dependency = %dependency.id, error = %e, "Dependency activation failed");
                return Err(Error::DependencyFailed {
                    plugin: id.to_string(),
                    dependency: dependency.id.clone(),
                });
            }
        }

        let operation = self
            .resources
            .track_operation(id, OperationKind::Lifecycle)
            .await;
        let ctx = PluginContext::new(id, self.api.clone());
        let activated = self.registry.activate(id, ctx).await;
        operation.complete().await;

        if !activated {
            let reason = self
                .registry
                .last_error(id)
                .await
                .unwrap_or_else(|| "activation failed".to_string());
            return Err(Error::PluginFailed(id.to_string(), reason));
        }

        let methods = self.api.register_plugin_api(id, plugin.hooks().public_api());
        if !methods.is_empty() {
            debug!(plugin_id = %id, methods = ?methods, "Public API registered");
        }
        self.compatibility.clear().await;
        self.persist_states().await;
        Ok(())
    }

    /// Active plugins that declare a dependency on `id`
    async fn active_dependents(&self, id: &str) -> Vec<String> {
        let mut dependents = Vec::new();
        for other in self.registry.active_ids().await {
            if other == id {
                continue;
            }
            if self
                .registry
                .dependencies_of(&other)
                .await
                .iter()
                .any(|d| d.id == id)
            {
                dependents.push(other);
            }
        }
        dependents
    }

    /// Deactivate a plugin; `Ok(false)` means it is inactive but teardown failed
    pub async fn try_deactivate_plugin(&self, id: &str, force: bool) -> Result<bool> {
        if !self.registry.contains(id).await {
            return Err(Error::PluginNotFound(id.to_string()));
        }
        if !self.registry.is_active(id).await {
            return Ok(true);
        }

        let dependents = self.active_dependents(id).await;
        if !dependents.is_empty() {
            if !force {
                return Err(Error::DependentsActive(id.to_string(), dependents.join(", ")));
            }
            warn!(plugin_id = %id, dependents = ?dependents, "Forcing deactivation with active dependents");
        }

        let clean = self.registry.deactivate(id).await;
        self.api.unregister_plugin_api(id);
        self.compatibility.clear().await;
        self.persist_states().await;
        Ok(clean)
    }

    /// Deactivate a plugin; `false` when refused or when teardown failed
    pub async fn deactivate_plugin(&self, id: &str, force: bool) -> bool {
        match self.try_deactivate_plugin(id, force).await {
            Ok(clean) => clean,
            Err(e) => {
                warn!(plugin_id = %id, error = %e, "Plugin not deactivated");
                false
            }
        }
    }

    /// Carry out deactivations requested by the security pipeline
    pub async fn process_security_actions(&self) -> usize {
        let mut pending = Vec::new();
        {
            let mut actions = self.actions.lock().await;
            while let Ok(action) = actions.try_recv() {
                pending.push(action);
            }
        }

        let mut handled = 0;
        for action in pending {
            match action {
                SecurityAction::Deactivate { plugin_id, reason } => {
                    if self.registry.is_active(&plugin_id).await {
                        warn!(plugin_id = %plugin_id, %reason, "Deactivating plugin on security request");
                        self.deactivate_plugin(&plugin_id, true).await;
                        handled += 1;
                    }
                }
            }
        }
        handled
    }

    /// Register a plugin at runtime
    pub async fn register_plugin(&self, plugin: Plugin) -> Result<()> {
        validate_manifest(&plugin.manifest)?;
        let id = plugin.id().to_string();
        if !self.registry.register(plugin).await {
            return Err(Error::InvalidDescriptor(format!("Could not register '{}'", id)));
        }
        self.compatibility.clear().await;
        self.compatibility.run_full_check(&id).await?;
        Ok(())
    }

    /// Deactivate if needed and drop a plugin's descriptor
    pub async fn unregister_plugin(&self, id: &str, force: bool) -> Result<()> {
        self.try_deactivate_plugin(id, force).await?;
        self.registry.unregister(id).await;
        self.api.unregister_plugin_api(id);
        self.resources.remove(id).await;
        self.sandbox.clear_errors(id).await;
        self.compatibility.clear().await;
        self.persist_states().await;
        Ok(())
    }

    /// Re-run discovery and restore the active set where possible
    pub async fn reload(&self) -> Result<ReloadSummary> {
        self.ensure_initialized()?;
        let active = self.registry.active_ids().await;
        let order = self.resolver.build_graph().await.order_ids(&active);
        for id in order.iter().rev() {
            self.deactivate_plugin(id, true).await;
        }

        self.compatibility.clear().await;
        self.sandbox.clear_reports().await;
        let registered = self.discover().await?;
        self.compatibility.check_all().await;

        let summary = self.reactivate(&order).await;
        info!(
            registered,
            restored = summary.restored.len(),
            lost = summary.lost.len(),
            "Plugins reloaded"
        );
        Ok(summary)
    }

    /// Every registered plugin with compatibility and security annotations
    pub async fn list_plugins(&self) -> Vec<PluginSummary> {
        let graph = self.resolver.build_graph().await;
        let mut summaries = Vec::new();
        for plugin in self.registry.all().await {
            let id = plugin.id().to_string();
            let state = self.registry.state(&id).await;
            let manifest = plugin.manifest;
            summaries.push(PluginSummary {
                active: state.as_ref().is_some_and(|s| s.active),
                compatible: state.as_ref().and_then(|s| s.compatible),
                compatibility_reason: state.as_ref().and_then(|s| s.compatibility_reason.clone()),
                last_error: state.and_then(|s| s.last_error),
                blacklisted: self.security.is_blacklisted(&id).await,
                restricted: self.resources.is_restricted(&id).await,
                security_score: self.security.security_score(&id).await,
                priority: graph.priority(&id),
                dependencies: manifest.dependency_ids(),
                permissions: self.permissions.record(&id).await,
                name: manifest.name,
                version: manifest.version,
                author: manifest.author,
                description: manifest.description,
                id,
            });
        }
        summaries
    }

    pub async fn compatibility_of(&self, id: &str) -> Result<CompatibilityResult> {
        self.compatibility.run_full_check(id).await
    }

    pub async fn security_stats(&self) -> SecurityStats {
        self.security.stats().await
    }

    pub async fn pending_permission_requests(&self) -> Vec<PermissionRequest> {
        self.permissions.pending_requests().await
    }

    pub async fn approve_permission(&self, id: &str, permission: &str) -> Result<()> {
        self.permissions.approve(id, permission).await
    }

    pub async fn reject_permission(&self, id: &str, permission: &str) -> Result<()> {
        self.permissions.reject(id, permission).await
    }

    pub async fn revoke_permission(&self, id: &str, permission: &str) -> Result<()> {
        self.permissions.revoke(id, permission).await
    }

    /// Change the global level; `false` when the setting could not be persisted
    pub async fn set_security_level(&self, level: SecurityLevel) -> bool {
        let persisted = self.security.set_security_level(level).await;
        self.sandbox.harden(&self.api).await;
        persisted
    }

    pub async fn toggle_check(&self, name: &str, enabled: bool) -> Result<bool> {
        self.security.toggle_check(name, enabled).await
    }

    /// Blacklist a plugin, deactivating it first when active
    pub async fn blacklist_plugin(&self, id: &str, reason: &str) -> bool {
        if self.registry.is_active(id).await {
            self.deactivate_plugin(id, true).await;
        }
        self.security.blacklist(id, reason).await
    }

    pub async fn whitelist_plugin(&self, id: &str) -> bool {
        self.security.whitelist(id).await
    }

    pub async fn set_audit_mode(&self, mode: AuditMode) {
        self.audit.set_mode(mode).await;
    }

    pub async fn clear_audit_log(&self) {
        self.audit.clear().await;
    }

    /// Filtered audit entries, pending batch included
    pub async fn audit_log(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.audit.flush().await;
        self.audit.query(filter).await
    }

    pub async fn load_order(&self) -> LoadOrder {
        self.resolver.load_order().await
    }

    pub async fn validate_all_plugins(&self) -> Vec<PluginValidation> {
        self.resolver.validate_all_plugins().await
    }

    /// Call a host or plugin method on behalf of `caller`
    pub async fn call_api(&self, caller: &str, method: &str, args: Value) -> Result<Value> {
        self.ensure_initialized()?;
        let result = self.api.invoke(caller, method, args).await;
        self.process_security_actions().await;
        result
    }

    /// Stop background loops, flush the audit log and persist states
    pub async fn shutdown(&self) -> bool {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.audit.flush().await;
        let persisted = self.persist_states().await;
        info!("Plugin manager shut down");
        persisted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PluginManifest;
    use crate::plugin::PluginHooks;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        activations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PluginHooks for Counting {
        async fn activate(&self, _ctx: PluginContext) -> anyhow::Result<bool> {
            self.activations.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    fn manifest(id: &str) -> PluginManifest {
        PluginManifest::new(id, "1.0.0").with_app_range("0.0.1", "99.0.0")
    }

    async fn manager(plugins: Vec<Plugin>) -> PluginManager {
        let mut builder = PluginManager::builder(WardenConfig::default());
        for plugin in plugins {
            builder = builder.plugin(plugin);
        }
        let manager = builder.build().await.unwrap();
        manager.initialize().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_activation_requires_initialization() {
        let manager = PluginManager::builder(WardenConfig::default())
            .plugin(Plugin::declarative(manifest("a")))
            .build()
            .await
            .unwrap();
        assert!(matches!(
            manager.try_activate_plugin("a").await,
            Err(Error::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_dependencies_activate_first() {
        let manager = manager(vec![
            Plugin::declarative(manifest("app").depends_on("lib", Some("1.0.0"))),
            Plugin::declarative(manifest("lib")),
        ])
        .await;

        assert!(manager.activate_plugin("app").await);
        assert!(manager.registry().is_active("lib").await);

        let activated: Vec<String> = manager
            .bus()
            .events_by_topic(Topic::PluginActivated)
            .await
            .into_iter()
            .filter_map(|e| e.plugin_id)
            .collect();
        assert_eq!(activated, vec!["lib".to_string(), "app".to_string()]);
    }

    #[tokio::test]
    async fn test_shared_dependency_cycle_is_guarded() {
        let count = Arc::new(AtomicUsize::new(0));
        let manager = manager(vec![
            Plugin::new(
                manifest("a").depends_on("b", None),
                Counting { activations: count.clone() },
            ),
            Plugin::new(
                manifest("b").depends_on("a", None),
                Counting { activations: count.clone() },
            ),
        ])
        .await;

        assert!(manager.activate_plugin("a").await);
        assert!(manager.registry().is_active("a").await);
        assert!(manager.registry().is_active("b").await);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_deactivation_refused_with_active_dependents() {
        let manager = manager(vec![
            Plugin::declarative(manifest("app").depends_on("lib", None)),
            Plugin::declarative(manifest("lib")),
        ])
        .await;
        manager.activate_plugin("app").await;

        assert!(matches!(
            manager.try_deactivate_plugin("lib", false).await,
            Err(Error::DependentsActive(..))
        ));
        assert!(manager.registry().is_active("lib").await);

        assert!(manager.deactivate_plugin("lib", true).await);
        assert!(!manager.registry().is_active("lib").await);
    }

    #[tokio::test]
    async fn test_missing_app_range_blocks_activation() {
        let manager = manager(vec![Plugin::declarative(PluginManifest::new("bare", "1.0.0"))]).await;
        assert!(matches!(
            manager.try_activate_plugin("bare").await,
            Err(Error::Incompatible(..))
        ));
        assert!(manager.registry().last_error("bare").await.is_some());
    }

    #[tokio::test]
    async fn test_invalid_descriptor_is_not_registered() {
        let mut bad = manifest("bad");
        bad.version = "not-a-version".to_string();
        let manager = manager(vec![Plugin::declarative(bad)]).await;
        assert!(!manager.registry().contains("bad").await);
    }

    #[tokio::test]
    async fn test_core_storage_is_namespaced_per_plugin() {
        let manager = manager(vec![]).await;
        manager
            .permissions()
            .validate_permissions("p", &["storage".to_string()])
            .await;

        manager
            .call_api("p", "storage.set", json!({ "key": "k", "value": 7 }))
            .await
            .unwrap();
        let value = manager
            .call_api("p", "storage.get", json!({ "key": "k" }))
            .await
            .unwrap();
        assert_eq!(value, json!(7));

        let raw = manager.store.get("plugin_data.p.k").await.unwrap();
        assert_eq!(raw, Some(json!(7)));
    }

    #[tokio::test]
    async fn test_shutdown_persists_states() {
        let manager = manager(vec![Plugin::declarative(manifest("a"))]).await;
        manager.activate_plugin("a").await;
        assert!(manager.shutdown().await);

        let states = manager.store.get(PLUGIN_STATES_KEY).await.unwrap().unwrap();
        assert_eq!(states, json!({ "a": true }));
    }
}
