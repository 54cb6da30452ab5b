//! Permission checker
//!
//! A fixed catalog maps permission names to a risk tier and the host methods
//! they gate. Each plugin has three disjoint sets (approved, pending,
//! revoked); requests move `unrequested -> pending -> approved | rejected`,
//! and `approved -> revoked` separately.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use warden_core::config::WardenConfig;
use warden_core::events::{EventBus, PluginEvent, Topic};
use warden_core::policy::SecurityLevel;
use warden_core::storage::{KeyValueStore, PERMISSIONS_KEY};
use warden_core::{Error, Result};

/// How dangerous a permission is to grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PermissionSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub risk: RiskTier,
    pub methods: &'static [&'static str],
}

pub const CATALOG: &[PermissionSpec] = &[
    PermissionSpec {
        name: "ui",
        description: "Show interface elements",
        risk: RiskTier::Low,
        methods: &["ui.notify", "ui.render"],
    },
    PermissionSpec {
        name: "events",
        description: "Publish and subscribe to host events",
        risk: RiskTier::Low,
        methods: &["events.subscribe", "events.publish"],
    },
    PermissionSpec {
        name: "notifications",
        description: "Show system notifications",
        risk: RiskTier::Low,
        methods: &["notifications.show"],
    },
    PermissionSpec {
        name: "storage",
        description: "Read and write plugin-scoped storage",
        risk: RiskTier::Medium,
        methods: &["storage.get", "storage.set", "storage.remove"],
    },
    PermissionSpec {
        name: "dom",
        description: "Query and modify the host document",
        risk: RiskTier::Medium,
        methods: &["dom.query", "dom.modify"],
    },
    PermissionSpec {
        name: "settings",
        description: "Read and change host settings",
        risk: RiskTier::Medium,
        methods: &["settings.read", "settings.write"],
    },
    PermissionSpec {
        name: "clipboard",
        description: "Access the clipboard",
        risk: RiskTier::High,
        methods: &["clipboard.read", "clipboard.write"],
    },
    PermissionSpec {
        name: "network",
        description: "Make network requests",
        risk: RiskTier::High,
        methods: &["network.fetch", "network.websocket"],
    },
    PermissionSpec {
        name: "code_execution",
        description: "Evaluate or load additional code",
        risk: RiskTier::Critical,
        methods: &["code.eval", "code.load_script"],
    },
];

/// Catalog entry for a permission name
pub fn lookup(name: &str) -> Option<&'static PermissionSpec> {
    CATALOG.iter().find(|p| p.name == name)
}

/// Permission gating a host method, if any
pub fn permission_for_method(method: &str) -> Option<&'static str> {
    CATALOG
        .iter()
        .find(|p| p.methods.contains(&method))
        .map(|p| p.name)
}

/// Permissions granted without review at each level
///
/// Looser levels grant more: low is a development setting.
pub fn auto_approved(level: SecurityLevel) -> &'static [&'static str] {
    match level {
        SecurityLevel::Low => &["ui", "events", "notifications", "storage", "dom", "settings"],
        SecurityLevel::Normal => &["ui", "events", "notifications", "storage"],
        SecurityLevel::High => &["ui", "events"],
    }
}

/// Approved, pending, revoked and rejected permissions of one plugin
///
/// Revoked and rejected permissions stay denied until explicitly approved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub approved: BTreeSet<String>,
    pub pending: BTreeSet<String>,
    pub revoked: BTreeSet<String>,
    #[serde(default)]
    pub rejected: BTreeSet<String>,
}

impl PermissionRecord {
    fn is_denied(&self, permission: &str) -> bool {
        self.revoked.contains(permission) || self.rejected.contains(permission)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

/// A permission awaiting (or having received) a decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: Uuid,
    pub plugin_id: String,
    pub permission: String,
    pub risk: RiskTier,
    pub status: RequestStatus,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Partition of a permission request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionValidation {
    pub invalid: Vec<String>,
    pub already_approved: Vec<String>,
    pub auto_approved: Vec<String>,
    pub pending: Vec<String>,
    /// Previously revoked or rejected; not filed again
    #[serde(default)]
    pub denied: Vec<String>,
}

impl PermissionValidation {
    /// Everything requested is usable now
    pub fn fully_granted(&self) -> bool {
        self.invalid.is_empty() && self.pending.is_empty() && self.denied.is_empty()
    }
}

/// Outcome of a method access check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodAccess {
    Allowed,
    Denied(String),
}

impl MethodAccess {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Persisted {
    records: HashMap<String, PermissionRecord>,
    requests: Vec<PermissionRequest>,
}

struct Inner {
    records: HashMap<String, PermissionRecord>,
    requests: Vec<PermissionRequest>,
    level: SecurityLevel,
    enforce: bool,
    fail_closed_unmapped: bool,
}

pub struct PermissionChecker {
    store: Arc<dyn KeyValueStore>,
    bus: Arc<EventBus>,
    inner: RwLock<Inner>,
}

impl PermissionChecker {
    pub fn new(store: Arc<dyn KeyValueStore>, bus: Arc<EventBus>, config: &WardenConfig) -> Self {
        Self {
            store,
            bus,
            inner: RwLock::new(Inner {
                records: HashMap::new(),
                requests: Vec::new(),
                level: config.security.level,
                enforce: config.security.checks.permission_enforcement,
                fail_closed_unmapped: config.security.fail_closed_unmapped,
            }),
        }
    }

    /// Restore persisted records and requests
    pub async fn load(&self) -> Result<()> {
        let Some(value) = self.store.get(PERMISSIONS_KEY).await? else {
            return Ok(());
        };
        let persisted: Persisted = serde_json::from_value(value)?;
        let mut inner = self.inner.write().await;
        inner.records = persisted.records;
        inner.requests = persisted.requests;
        debug!(plugins = inner.records.len(), "Permission records loaded");
        Ok(())
    }

    async fn persist(&self) -> bool {
        let snapshot = {
            let inner = self.inner.read().await;
            Persisted {
                records: inner.records.clone(),
                requests: inner.requests.clone(),
            }
        };
        let result = match serde_json::to_value(&snapshot) {
            Ok(value) => self.store.set(PERMISSIONS_KEY, value).await,
            Err(e) => Err(Error::from(e)),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to persist permission records");
                false
            }
        }
    }

    pub async fn security_level(&self) -> SecurityLevel {
        self.inner.read().await.level
    }

    pub async fn set_security_level(&self, level: SecurityLevel) {
        self.inner.write().await.level = level;
    }

    pub async fn set_enforcement(&self, enabled: bool) {
        self.inner.write().await.enforce = enabled;
    }

    pub async fn enforcement(&self) -> bool {
        self.inner.read().await.enforce
    }

    /// Partition requested permissions and file the ones needing review
    pub async fn validate_permissions(
        &self,
        plugin_id: &str,
        requested: &[String],
    ) -> PermissionValidation {
        let mut result = PermissionValidation::default();
        let mut new_requests = Vec::new();

        {
            let mut inner = self.inner.write().await;
            let allow_list = auto_approved(inner.level);
            let Inner {
                records, requests, ..
            } = &mut *inner;
            let record = records.entry(plugin_id.to_string()).or_default();

            for name in requested {
                let Some(spec) = lookup(name) else {
                    result.invalid.push(name.clone());
                    continue;
                };

                if record.approved.contains(name) {
                    result.already_approved.push(name.clone());
                } else if record.is_denied(name) {
                    result.denied.push(name.clone());
                } else if allow_list.contains(&spec.name) {
                    record.pending.remove(name);
                    record.approved.insert(name.clone());
                    result.auto_approved.push(name.clone());
                } else {
                    result.pending.push(name.clone());
                    if record.pending.insert(name.clone()) {
                        let request = PermissionRequest {
                            id: Uuid::new_v4(),
                            plugin_id: plugin_id.to_string(),
                            permission: name.clone(),
                            risk: spec.risk,
                            status: RequestStatus::Pending,
                            requested_at: Utc::now(),
                            resolved_at: None,
                        };
                        requests.push(request.clone());
                        new_requests.push(request);
                    }
                }
            }
        }

        if !result.invalid.is_empty() {
            warn!(plugin_id = %plugin_id, invalid = ?result.invalid, "Unknown permissions requested");
        }
        for name in &result.auto_approved {
            self.bus
                .publish(PluginEvent::for_plugin(
                    Topic::PermissionApproved,
                    plugin_id,
                    json!({ "permission": name, "auto": true }),
                ))
                .await;
        }
        for request in &new_requests {
            self.bus
                .publish(PluginEvent::for_plugin(
                    Topic::PermissionRequested,
                    plugin_id,
                    json!({
                        "permission": request.permission,
                        "request_id": request.id,
                        "risk": request.risk,
                    }),
                ))
                .await;
        }

        self.persist().await;
        result
    }

    fn resolve_requests(
        requests: &mut [PermissionRequest],
        plugin_id: &str,
        permission: &str,
        status: RequestStatus,
    ) {
        for request in requests.iter_mut().filter(|r| {
            r.plugin_id == plugin_id && r.permission == permission && r.status == RequestStatus::Pending
        }) {
            request.status = status;
            request.resolved_at = Some(Utc::now());
        }
    }

    /// Grant a permission, resolving any pending request for it
    pub async fn approve(&self, plugin_id: &str, permission: &str) -> Result<()> {
        lookup(permission).ok_or_else(|| Error::UnknownPermission(permission.to_string()))?;

        {
            let mut inner = self.inner.write().await;
            let Inner {
                records, requests, ..
            } = &mut *inner;
            let record = records.entry(plugin_id.to_string()).or_default();
            record.pending.remove(permission);
            record.revoked.remove(permission);
            record.rejected.remove(permission);
            record.approved.insert(permission.to_string());
            Self::resolve_requests(requests, plugin_id, permission, RequestStatus::Approved);
        }

        info!(plugin_id = %plugin_id, %permission, "Permission approved");
        self.bus
            .publish(PluginEvent::for_plugin(
                Topic::PermissionApproved,
                plugin_id,
                json!({ "permission": permission, "auto": false }),
            ))
            .await;
        self.persist().await;
        Ok(())
    }

    /// Decline a pending permission
    pub async fn reject(&self, plugin_id: &str, permission: &str) -> Result<()> {
        lookup(permission).ok_or_else(|| Error::UnknownPermission(permission.to_string()))?;

        {
            let mut inner = self.inner.write().await;
            let Inner {
                records, requests, ..
            } = &mut *inner;
            let Some(record) = records
                .get_mut(plugin_id)
                .filter(|r| r.pending.contains(permission))
            else {
                return Err(Error::InvalidInput(format!(
                    "No pending request for '{}' from plugin '{}'",
                    permission, plugin_id
                )));
            };
            record.pending.remove(permission);
            record.rejected.insert(permission.to_string());
            Self::resolve_requests(requests, plugin_id, permission, RequestStatus::Rejected);
        }

        info!(plugin_id = %plugin_id, %permission, "Permission rejected");
        self.bus
            .publish(PluginEvent::for_plugin(
                Topic::PermissionRejected,
                plugin_id,
                json!({ "permission": permission }),
            ))
            .await;
        self.persist().await;
        Ok(())
    }

    /// Withdraw an approved permission
    pub async fn revoke(&self, plugin_id: &str, permission: &str) -> Result<()> {
        lookup(permission).ok_or_else(|| Error::UnknownPermission(permission.to_string()))?;

        {
            let mut inner = self.inner.write().await;
            let Some(record) = inner.records.get_mut(plugin_id) else {
                return Err(Error::InvalidInput(format!(
                    "Plugin '{}' holds no permissions",
                    plugin_id
                )));
            };
            if !record.approved.remove(permission) {
                return Err(Error::InvalidInput(format!(
                    "Permission '{}' is not approved for plugin '{}'",
                    permission, plugin_id
                )));
            }
            record.revoked.insert(permission.to_string());
        }

        info!(plugin_id = %plugin_id, %permission, "Permission revoked");
        self.bus
            .publish(PluginEvent::for_plugin(
                Topic::PermissionRevoked,
                plugin_id,
                json!({ "permission": permission }),
            ))
            .await;
        self.persist().await;
        Ok(())
    }

    pub async fn has_permission(&self, plugin_id: &str, permission: &str) -> bool {
        self.inner
            .read()
            .await
            .records
            .get(plugin_id)
            .is_some_and(|r| r.approved.contains(permission))
    }

    pub async fn record(&self, plugin_id: &str) -> PermissionRecord {
        self.inner
            .read()
            .await
            .records
            .get(plugin_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn approved(&self, plugin_id: &str) -> Vec<String> {
        self.record(plugin_id).await.approved.into_iter().collect()
    }

    /// Requests still awaiting a decision, oldest first
    pub async fn pending_requests(&self) -> Vec<PermissionRequest> {
        self.inner
            .read()
            .await
            .requests
            .iter()
            .filter(|r| r.status == RequestStatus::Pending)
            .cloned()
            .collect()
    }

    pub async fn requests_for(&self, plugin_id: &str) -> Vec<PermissionRequest> {
        self.inner
            .read()
            .await
            .requests
            .iter()
            .filter(|r| r.plugin_id == plugin_id)
            .cloned()
            .collect()
    }

    /// May `plugin_id` call `method`?
    pub async fn check_method_access(&self, plugin_id: &str, method: &str) -> MethodAccess {
        let inner = self.inner.read().await;
        if !inner.enforce {
            return MethodAccess::Allowed;
        }

        match permission_for_method(method) {
            Some(permission) => {
                let granted = inner
                    .records
                    .get(plugin_id)
                    .is_some_and(|r| r.approved.contains(permission));
                if granted {
                    MethodAccess::Allowed
                } else {
                    MethodAccess::Denied(format!(
                        "Method '{}' requires permission '{}'",
                        method, permission
                    ))
                }
            }
            None if inner.level == SecurityLevel::High && inner.fail_closed_unmapped => {
                MethodAccess::Denied(format!(
                    "Method '{}' is not mapped to any permission and unmapped methods are closed at high security",
                    method
                ))
            }
            None => MethodAccess::Allowed,
        }
    }
}
