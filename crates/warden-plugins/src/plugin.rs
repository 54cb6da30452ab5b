//! Plugin contract: hooks, context and public API handlers

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::PluginManifest;
use crate::api::HostApi;
use warden_core::Result;

/// A single call into a host or plugin method
#[derive(Debug, Clone)]
pub struct ApiCall {
    /// Plugin id of the caller, or `host`
    pub caller: String,
    pub args: Value,
}

/// Async method handler
pub type ApiHandler = Arc<dyn Fn(ApiCall) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Wrap an async closure as an [`ApiHandler`]
pub fn api_handler<F, Fut>(f: F) -> ApiHandler
where
    F: Fn(ApiCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |call| Box::pin(f(call)))
}

/// A named method a plugin exposes to the host and other plugins
#[derive(Clone)]
pub struct PublicMethod {
    pub name: String,
    pub handler: ApiHandler,
}

impl PublicMethod {
    pub fn new(name: impl Into<String>, handler: ApiHandler) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

impl fmt::Debug for PublicMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicMethod").field("name", &self.name).finish()
    }
}

/// Lifecycle entry points supplied by plugin code
///
/// Errors and panics raised here never propagate out of the manager; they are
/// recorded against the plugin and reported as a failed transition.
#[async_trait]
pub trait PluginHooks: Send + Sync {
    /// Bring the plugin up. `Ok(false)` is a refusal, not an error.
    async fn activate(&self, ctx: PluginContext) -> anyhow::Result<bool>;

    /// Tear the plugin down. The plugin is marked inactive whatever this returns.
    async fn deactivate(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Methods registered under `<plugin-id>.<name>` while the plugin is active
    fn public_api(&self) -> Vec<PublicMethod> {
        Vec::new()
    }
}

/// Hooks for manifest-only plugins: nothing to run, always succeed
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclarativeHooks;

#[async_trait]
impl PluginHooks for DeclarativeHooks {
    async fn activate(&self, _ctx: PluginContext) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// A registered unit of extension code: descriptor plus entry points
#[derive(Clone)]
pub struct Plugin {
    pub manifest: PluginManifest,
    hooks: Arc<dyn PluginHooks>,
}

impl Plugin {
    pub fn new(manifest: PluginManifest, hooks: impl PluginHooks + 'static) -> Self {
        Self {
            manifest,
            hooks: Arc::new(hooks),
        }
    }

    /// A plugin with no code of its own
    pub fn declarative(manifest: PluginManifest) -> Self {
        Self::new(manifest, DeclarativeHooks)
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn hooks(&self) -> Arc<dyn PluginHooks> {
        Arc::clone(&self.hooks)
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.manifest.id)
            .field("version", &self.manifest.version)
            .finish()
    }
}

/// Handle given to a plugin on activation; its only route into the host
#[derive(Clone)]
pub struct PluginContext {
    plugin_id: String,
    api: Arc<HostApi>,
}

impl PluginContext {
    pub fn new(plugin_id: impl Into<String>, api: Arc<HostApi>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            api,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Call a host capability or another plugin's public method
    pub async fn invoke(&self, method: &str, args: Value) -> Result<Value> {
        self.api.invoke(&self.plugin_id, method, args).await
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .finish()
    }
}
