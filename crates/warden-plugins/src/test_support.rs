//! Shared fixtures for unit tests

use std::sync::Arc;

use crate::api::HostApi;
use crate::permissions::PermissionChecker;
use crate::plugin::PluginContext;
use crate::resources::ResourceMonitor;
use warden_core::config::WardenConfig;
use warden_core::events::EventBus;
use warden_core::storage::MemoryStore;

pub fn host_api(bus: &Arc<EventBus>) -> Arc<HostApi> {
    let config = WardenConfig::default();
    let store = Arc::new(MemoryStore::new());
    let permissions = Arc::new(PermissionChecker::new(store, bus.clone(), &config));
    let resources = Arc::new(ResourceMonitor::new(bus.clone(), &config));
    Arc::new(HostApi::new(permissions, resources, bus.clone()))
}

pub fn context(bus: &Arc<EventBus>, id: &str) -> PluginContext {
    PluginContext::new(id, host_api(bus))
}
