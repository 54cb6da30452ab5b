//! Host API
//!
//! The single route from plugin code into the host. Every call is checked
//! against the caller's permissions and counted by the resource monitor.
//! Plugin public methods live in the same table under `<plugin-id>.<name>`
//! and run inside the sandbox.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::permissions::{MethodAccess, PermissionChecker};
use crate::plugin::{ApiCall, ApiHandler, PublicMethod};
use crate::resources::{OperationKind, ResourceMonitor};
use crate::sandbox::Sandbox;
use warden_core::events::{EventBus, PluginEvent, Topic};
use warden_core::{Error, Result};

/// Caller id used for calls made by the host itself
pub const HOST_CALLER: &str = "host";

#[derive(Clone)]
enum Entry {
    Core(ApiHandler),
    Plugin { owner: String, handler: ApiHandler },
}

pub struct HostApi {
    methods: RwLock<HashMap<String, Entry>>,
    frozen: AtomicBool,
    permissions: Arc<PermissionChecker>,
    resources: Arc<ResourceMonitor>,
    bus: Arc<EventBus>,
    sandbox: Option<Arc<Sandbox>>,
}

impl std::fmt::Debug for HostApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostApi")
            .field("frozen", &self.is_frozen())
            .finish_non_exhaustive()
    }
}

impl HostApi {
    pub fn new(
        permissions: Arc<PermissionChecker>,
        resources: Arc<ResourceMonitor>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
            frozen: AtomicBool::new(false),
            permissions,
            resources,
            bus,
            sandbox: None,
        }
    }

    /// Run plugin-owned methods inside `sandbox`
    pub fn with_sandbox(mut self, sandbox: Arc<Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Add a host capability; refused once the table is frozen
    pub fn register_core(&self, name: &str, handler: ApiHandler) -> Result<()> {
        if self.is_frozen() {
            return Err(Error::InvalidInput(format!(
                "Core host API is frozen; cannot register '{}'",
                name
            )));
        }
        let mut methods = self
            .methods
            .write()
            .map_err(|_| Error::Other("host API table poisoned".to_string()))?;
        methods.insert(name.to_string(), Entry::Core(handler));
        Ok(())
    }

    /// Stop accepting core registrations
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Publish a plugin's methods as `<plugin-id>.<name>`
    pub fn register_plugin_api(&self, plugin_id: &str, api: Vec<PublicMethod>) -> Vec<String> {
        let Ok(mut methods) = self.methods.write() else {
            return Vec::new();
        };
        let mut names = Vec::new();
        for method in api {
            let name = format!("{}.{}", plugin_id, method.name);
            if matches!(methods.get(&name), Some(Entry::Core(_))) {
                warn!(plugin_id = %plugin_id, method = %name, "Plugin method shadows a core method, skipping");
                continue;
            }
            methods.insert(
                name.clone(),
                Entry::Plugin {
                    owner: plugin_id.to_string(),
                    handler: method.handler,
                },
            );
            names.push(name);
        }
        debug!(plugin_id = %plugin_id, methods = names.len(), "Plugin API registered");
        names
    }

    /// Drop every method a plugin owns
    pub fn unregister_plugin_api(&self, plugin_id: &str) -> usize {
        let Ok(mut methods) = self.methods.write() else {
            return 0;
        };
        let before = methods.len();
        methods.retain(|_, entry| !matches!(entry, Entry::Plugin { owner, .. } if owner == plugin_id));
        before - methods.len()
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .methods
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods
            .read()
            .map(|m| m.contains_key(name))
            .unwrap_or(false)
    }

    fn lookup(&self, method: &str) -> Result<Entry> {
        self.methods
            .read()
            .map_err(|_| Error::Other("host API table poisoned".to_string()))?
            .get(method)
            .cloned()
            .ok_or_else(|| Error::MethodNotFound(method.to_string()))
    }

    /// Call `method` on behalf of plugin `caller`
    pub async fn invoke(&self, caller: &str, method: &str, args: Value) -> Result<Value> {
        let entry = self.lookup(method)?;

        if let MethodAccess::Denied(reason) =
            self.permissions.check_method_access(caller, method).await
        {
            warn!(plugin_id = %caller, %method, %reason, "Host API call denied");
            self.bus
                .publish(PluginEvent::for_plugin(
                    Topic::PermissionDenied,
                    caller,
                    json!({ "method": method, "reason": reason }),
                ))
                .await;
            return Err(Error::PermissionDenied {
                plugin: caller.to_string(),
                reason,
            });
        }

        let operation = self
            .resources
            .track_operation(caller, OperationKind::for_method(method))
            .await;
        let result = self.dispatch(entry, caller, method, args).await;
        operation.complete().await;
        result
    }

    /// Call `method` as the host: no permission check, no quota
    pub async fn invoke_as_host(&self, method: &str, args: Value) -> Result<Value> {
        let entry = self.lookup(method)?;
        self.dispatch(entry, HOST_CALLER, method, args).await
    }

    async fn dispatch(&self, entry: Entry, caller: &str, method: &str, args: Value) -> Result<Value> {
        let call = ApiCall {
            caller: caller.to_string(),
            args,
        };
        match entry {
            Entry::Core(handler) => handler(call)
                .await
                .map_err(|e| Error::Other(format!("{}: {:#}", method, e))),
            Entry::Plugin { owner, handler } => match &self.sandbox {
                Some(sandbox) => sandbox.execute_sandboxed(&owner, method, handler(call)).await,
                None => handler(call)
                    .await
                    .map_err(|e| Error::PluginFailed(owner, format!("{:#}", e))),
            },
        }
    }
}
