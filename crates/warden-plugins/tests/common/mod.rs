//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use warden_core::config::WardenConfig;
use warden_core::policy::SecurityLevel;
use warden_core::storage::KeyValueStore;
use warden_plugins::{Plugin, PluginContext, PluginHooks, PluginManager, PublicMethod};
use warden_plugins::{ApiCall, PluginManifest, api_handler};

/// Manifest compatible with any host version
pub fn manifest(id: &str) -> PluginManifest {
    PluginManifest::new(id, "1.0.0").with_app_range("0.0.1", "99.0.0")
}

pub fn config_at(level: SecurityLevel) -> WardenConfig {
    let mut config = WardenConfig::default();
    config.security.level = level;
    config
}

pub async fn start(
    config: WardenConfig,
    store: Arc<dyn KeyValueStore>,
    plugins: Vec<Plugin>,
) -> PluginManager {
    let mut builder = PluginManager::builder(config).store(store);
    for plugin in plugins {
        builder = builder.plugin(plugin);
    }
    let manager = builder.build().await.expect("build manager");
    manager.initialize().await.expect("initialize manager");
    manager
}

/// Counts activations and deactivations
#[derive(Clone, Default)]
pub struct Counter {
    pub activations: Arc<AtomicUsize>,
    pub deactivations: Arc<AtomicUsize>,
}

impl Counter {
    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn deactivations(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PluginHooks for Counter {
    async fn activate(&self, _ctx: PluginContext) -> anyhow::Result<bool> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn deactivate(&self) -> anyhow::Result<bool> {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Never finishes activating
pub struct Hangs;

#[async_trait]
impl PluginHooks for Hangs {
    async fn activate(&self, _ctx: PluginContext) -> anyhow::Result<bool> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(true)
    }
}

/// Panics on activation
pub struct Panics;

#[async_trait]
impl PluginHooks for Panics {
    async fn activate(&self, _ctx: PluginContext) -> anyhow::Result<bool> {
        panic!("plugin bug");
    }
}

/// Activates but fails teardown
pub struct BadTeardown;

#[async_trait]
impl PluginHooks for BadTeardown {
    async fn activate(&self, _ctx: PluginContext) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn deactivate(&self) -> anyhow::Result<bool> {
        anyhow::bail!("resources still held")
    }
}

/// Exposes `<id>.greet`
pub struct Greeter;

#[async_trait]
impl PluginHooks for Greeter {
    async fn activate(&self, ctx: PluginContext) -> anyhow::Result<bool> {
        ctx.invoke("ui.notify", serde_json::json!({ "message": "greeter ready" }))
            .await?;
        Ok(true)
    }

    fn public_api(&self) -> Vec<PublicMethod> {
        vec![PublicMethod::new(
            "greet",
            api_handler(|call: ApiCall| async move {
                let name = call.args.get("name").and_then(|v| v.as_str()).unwrap_or("world");
                Ok(serde_json::json!(format!("hello {} from {}", name, call.caller)))
            }),
        )]
    }
}
