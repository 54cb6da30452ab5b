//! Security manager
//!
//! Turns raw signals from the sandbox, resource monitor and permission
//! checker into scored [`SecurityEvent`]s, forwards them to the audit log and
//! decides a consequence. Deactivations are requested over a channel; the
//! plugin manager carries them out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::PluginManifest;
use crate::audit::{AuditEntry, AuditLog};
use crate::permissions::{PermissionChecker, PermissionValidation};
use crate::resources::ResourceMonitor;
use crate::sandbox::{AnalysisReport, Sandbox};
use warden_core::config::WardenConfig;
use warden_core::events::{EventBus, EventSubscriber, PluginEvent, Topic};
use warden_core::policy::{ActiveChecks, SecurityLevel, Severity};
use warden_core::storage::{BLACKLIST_KEY, KeyValueStore, SECURITY_SETTINGS_KEY};
use warden_core::{Error, Result};

/// Recent security events kept in memory
const RECENT_EVENTS: usize = 100;

/// Prior warnings before a high-severity event deactivates
const HIGH_DEACTIVATE_AFTER: u32 = 3;
/// Prior warnings before a medium-severity event throttles
const MEDIUM_THROTTLE_AFTER: u32 = 5;

const SIGNAL_TOPICS: &[Topic] = &[
    Topic::SandboxError,
    Topic::SandboxTimeout,
    Topic::ResourceViolation,
    Topic::PermissionDenied,
    Topic::StaticAnalysisFailed,
];

/// Work the plugin manager must carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityAction {
    Deactivate { plugin_id: String, reason: String },
}

/// What the security manager decided to do about an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consequence {
    DeactivateAndBlacklist,
    Deactivate,
    Throttle,
    Monitor,
    LogOnly,
}

impl Consequence {
    /// Decide by severity and the plugin's warnings before this event
    pub fn decide(severity: Severity, prior_warnings: u32) -> Self {
        match severity {
            Severity::Critical => Self::DeactivateAndBlacklist,
            Severity::High if prior_warnings > HIGH_DEACTIVATE_AFTER => Self::Deactivate,
            Severity::High => Self::Throttle,
            Severity::Medium if prior_warnings > MEDIUM_THROTTLE_AFTER => Self::Throttle,
            Severity::Medium => Self::LogOnly,
            Severity::Low => Self::Monitor,
        }
    }
}

/// Base severity of a raw signal
pub fn base_severity(topic: Topic, data: &Value) -> Severity {
    match topic {
        Topic::StaticAnalysisFailed => data
            .get("severity")
            .and_then(|s| serde_json::from_value(s.clone()).ok())
            .unwrap_or(Severity::High),
        Topic::SandboxError | Topic::SandboxTimeout | Topic::ResourceViolation => Severity::Medium,
        _ => Severity::Low,
    }
}

/// Warning penalty per severity
fn severity_penalty(severity: Severity) -> u32 {
    match severity {
        Severity::Low => 2,
        Severity::Medium => 5,
        Severity::High => 15,
        Severity::Critical => 30,
    }
}

/// Penalty for holding a permission
fn permission_penalty(permission: &str) -> u32 {
    match permission {
        "storage" => 5,
        "dom" => 10,
        "network" => 15,
        "code_execution" => 25,
        _ => 0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Originating event name
    pub kind: String,
    pub plugin_id: Option<String>,
    pub severity: Severity,
    pub repeated: bool,
    pub intentional: bool,
    pub consequence: Consequence,
    pub details: Value,
}

/// Outcome of validating a plugin before activation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSecurityReport {
    pub plugin_id: String,
    pub analysis: AnalysisReport,
    pub permissions: PermissionValidation,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityStats {
    pub level: SecurityLevel,
    pub checks: ActiveChecks,
    pub blacklisted: usize,
    pub total_events: usize,
    pub events_by_severity: BTreeMap<Severity, usize>,
    pub warnings: BTreeMap<String, u32>,
    pub restricted: Vec<String>,
    pub monitored: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSettings {
    level: SecurityLevel,
    checks: ActiveChecks,
}

#[derive(Debug, Default)]
struct Warnings {
    total: u32,
    by_severity: BTreeMap<Severity, u32>,
}

struct Inner {
    level: SecurityLevel,
    checks: ActiveChecks,
    blacklist: BTreeSet<String>,
    monitored: BTreeSet<String>,
    recent: VecDeque<SecurityEvent>,
    warnings: HashMap<String, Warnings>,
    events_by_severity: BTreeMap<Severity, usize>,
    total_events: usize,
}

pub struct SecurityManager {
    store: Arc<dyn KeyValueStore>,
    bus: Arc<EventBus>,
    permissions: Arc<PermissionChecker>,
    resources: Arc<ResourceMonitor>,
    sandbox: Arc<Sandbox>,
    audit: Arc<AuditLog>,
    actions: mpsc::UnboundedSender<SecurityAction>,
    inner: RwLock<Inner>,
}

impl SecurityManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &WardenConfig,
        store: Arc<dyn KeyValueStore>,
        bus: Arc<EventBus>,
        permissions: Arc<PermissionChecker>,
        resources: Arc<ResourceMonitor>,
        sandbox: Arc<Sandbox>,
        audit: Arc<AuditLog>,
        actions: mpsc::UnboundedSender<SecurityAction>,
    ) -> Self {
        Self {
            store,
            bus,
            permissions,
            resources,
            sandbox,
            audit,
            actions,
            inner: RwLock::new(Inner {
                level: config.security.level,
                checks: config.security.checks.clone(),
                blacklist: BTreeSet::new(),
                monitored: BTreeSet::new(),
                recent: VecDeque::with_capacity(RECENT_EVENTS),
                warnings: HashMap::new(),
                events_by_severity: BTreeMap::new(),
                total_events: 0,
            }),
        }
    }

    /// Restore persisted settings and blacklist, then push them to every component
    pub async fn init(&self) -> Result<()> {
        if let Some(value) = self.store.get(SECURITY_SETTINGS_KEY).await? {
            match serde_json::from_value::<PersistedSettings>(value) {
                Ok(settings) => {
                    let mut inner = self.inner.write().await;
                    inner.level = settings.level;
                    inner.checks = settings.checks;
                }
                Err(e) => warn!(error = %e, "Ignoring unreadable security settings"),
            }
        }

        if let Some(value) = self.store.get(BLACKLIST_KEY).await? {
            let ids: BTreeSet<String> = serde_json::from_value(value)?;
            self.inner.write().await.blacklist = ids;
        }

        self.permissions.load().await?;
        self.propagate().await;

        let inner = self.inner.read().await;
        info!(
            level = %inner.level,
            blacklisted = inner.blacklist.len(),
            "Security subsystem initialized"
        );
        Ok(())
    }

    async fn propagate(&self) {
        let (level, checks) = {
            let inner = self.inner.read().await;
            (inner.level, inner.checks.clone())
        };
        self.permissions.set_security_level(level).await;
        self.permissions
            .set_enforcement(checks.permission_enforcement)
            .await;
        self.resources.set_security_level(level).await;
        self.resources.set_enabled(checks.resource_monitoring).await;
        self.sandbox.set_security_level(level).await;
        self.sandbox.set_static_analysis(checks.static_analysis).await;
        self.sandbox.set_timeouts(checks.execution_timeouts).await;
        self.audit.set_security_level(level).await;
    }

    async fn persist_settings(&self) -> bool {
        let settings = {
            let inner = self.inner.read().await;
            PersistedSettings {
                level: inner.level,
                checks: inner.checks.clone(),
            }
        };
        let result = match serde_json::to_value(&settings) {
            Ok(value) => self.store.set(SECURITY_SETTINGS_KEY, value).await,
            Err(e) => Err(Error::from(e)),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to persist security settings");
                false
            }
        }
    }

    async fn persist_blacklist(&self) -> bool {
        let ids: Vec<String> = self.inner.read().await.blacklist.iter().cloned().collect();
        match self.store.set(BLACKLIST_KEY, json!(ids)).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to persist blacklist");
                false
            }
        }
    }

    pub async fn security_level(&self) -> SecurityLevel {
        self.inner.read().await.level
    }

    pub async fn checks(&self) -> ActiveChecks {
        self.inner.read().await.checks.clone()
    }

    /// Change the global level and propagate it
    pub async fn set_security_level(&self, level: SecurityLevel) -> bool {
        let previous = {
            let mut inner = self.inner.write().await;
            std::mem::replace(&mut inner.level, level)
        };
        self.propagate().await;
        let persisted = self.persist_settings().await;

        info!(from = %previous, to = %level, "Security level changed");
        self.bus
            .publish(PluginEvent::global(
                Topic::SecurityLevelChanged,
                json!({ "from": previous, "to": level }),
            ))
            .await;
        persisted
    }

    /// Enable or disable a named check
    pub async fn toggle_check(&self, name: &str, enabled: bool) -> Result<bool> {
        self.inner.write().await.checks.set(name, enabled)?;
        self.propagate().await;
        let persisted = self.persist_settings().await;

        info!(check = %name, enabled, "Security check toggled");
        self.bus
            .publish(PluginEvent::global(
                Topic::SecurityCheckToggled,
                json!({ "check": name, "enabled": enabled }),
            ))
            .await;
        Ok(persisted)
    }

    pub async fn is_blacklisted(&self, plugin_id: &str) -> bool {
        self.inner.read().await.blacklist.contains(plugin_id)
    }

    pub async fn blacklisted(&self) -> Vec<String> {
        self.inner.read().await.blacklist.iter().cloned().collect()
    }

    /// Deny a plugin until it is whitelisted; `false` if already listed
    pub async fn blacklist(&self, plugin_id: &str, reason: &str) -> bool {
        if !self.inner.write().await.blacklist.insert(plugin_id.to_string()) {
            return false;
        }
        self.persist_blacklist().await;
        warn!(plugin_id = %plugin_id, %reason, "Plugin blacklisted");
        self.bus
            .publish(PluginEvent::for_plugin(
                Topic::PluginBlacklisted,
                plugin_id,
                json!({ "reason": reason }),
            ))
            .await;
        true
    }

    /// Remove a plugin from the blacklist
    pub async fn whitelist(&self, plugin_id: &str) -> bool {
        if !self.inner.write().await.blacklist.remove(plugin_id) {
            return false;
        }
        self.persist_blacklist().await;
        info!(plugin_id = %plugin_id, "Plugin whitelisted");
        self.bus
            .publish(PluginEvent::for_plugin(Topic::PluginWhitelisted, plugin_id, json!({})))
            .await;
        true
    }

    /// Blacklist, static analysis and permission gate run before activation
    ///
    /// Pending permissions do not fail validation; calls needing them are
    /// denied at runtime instead.
    pub async fn validate_plugin(&self, manifest: &PluginManifest) -> Result<PluginSecurityReport> {
        let id = manifest.id.as_str();
        if self.is_blacklisted(id).await {
            return Err(Error::Blacklisted(id.to_string()));
        }

        let analysis = self.sandbox.analyze(manifest).await?;
        let permissions = self
            .permissions
            .validate_permissions(id, &manifest.permissions)
            .await;

        let failure = if !analysis.passed {
            let rules: Vec<&str> = analysis.findings.iter().map(|f| f.rule.as_str()).collect();
            Some(format!("static analysis flagged {}", rules.join(", ")))
        } else if !permissions.invalid.is_empty() {
            Some(format!(
                "unknown permissions requested: {}",
                permissions.invalid.join(", ")
            ))
        } else {
            None
        };

        let score = self.security_score(id).await;
        self.bus
            .publish(PluginEvent::for_plugin(
                Topic::ValidationCompleted,
                id,
                json!({
                    "passed": failure.is_none(),
                    "reason": failure,
                    "score": score,
                    "pending_permissions": permissions.pending,
                    "denied_permissions": permissions.denied,
                }),
            ))
            .await;

        match failure {
            Some(reason) => Err(Error::SecurityValidationFailed(id.to_string(), reason)),
            None => Ok(PluginSecurityReport {
                plugin_id: id.to_string(),
                analysis,
                permissions,
                score,
            }),
        }
    }

    /// Score a raw signal, record it and dispatch its consequence
    pub async fn report_signal(
        &self,
        topic: Topic,
        plugin_id: Option<&str>,
        data: &Value,
    ) -> SecurityEvent {
        let kind = topic.as_str();
        let intentional = data.get("severe").and_then(Value::as_bool).unwrap_or(false)
            || data.get("intentional").and_then(Value::as_bool).unwrap_or(false);

        let (event, prior) = {
            let mut inner = self.inner.write().await;
            let repeated = inner
                .recent
                .iter()
                .any(|e| e.kind == kind && e.plugin_id.as_deref() == plugin_id);

            let mut severity = base_severity(topic, data);
            if repeated || intentional {
                severity = severity.escalate();
            }

            let prior = plugin_id
                .and_then(|id| inner.warnings.get(id))
                .map(|w| w.total)
                .unwrap_or(0);
            let event = SecurityEvent {
                id: Uuid::new_v4(),
                timestamp: Utc::now(),
                kind: kind.to_string(),
                plugin_id: plugin_id.map(String::from),
                severity,
                repeated,
                intentional,
                consequence: Consequence::decide(severity, prior),
                details: data.clone(),
            };

            if inner.recent.len() == RECENT_EVENTS {
                inner.recent.pop_front();
            }
            inner.recent.push_back(event.clone());
            *inner.events_by_severity.entry(severity).or_default() += 1;
            inner.total_events += 1;
            if let Some(id) = plugin_id {
                let warnings = inner.warnings.entry(id.to_string()).or_default();
                warnings.total += 1;
                *warnings.by_severity.entry(severity).or_default() += 1;
            }
            (event, prior)
        };

        self.audit
            .record(AuditEntry::new(
                kind,
                event.plugin_id.clone(),
                event.severity,
                json!({
                    "details": event.details,
                    "repeated": event.repeated,
                    "intentional": event.intentional,
                    "consequence": event.consequence,
                }),
            ))
            .await;

        if let Some(id) = plugin_id {
            self.dispatch(id, &event, prior).await;
        }
        self.bus
            .publish(PluginEvent::new(
                Topic::SecurityEvent,
                event.plugin_id.clone(),
                json!({
                    "kind": event.kind,
                    "severity": event.severity,
                    "consequence": event.consequence,
                }),
            ))
            .await;
        event
    }

    async fn dispatch(&self, plugin_id: &str, event: &SecurityEvent, prior: u32) {
        let reason = format!("{} security event: {}", event.severity, event.kind);
        match event.consequence {
            Consequence::DeactivateAndBlacklist => {
                warn!(plugin_id = %plugin_id, %reason, "Deactivating and blacklisting plugin");
                self.request_deactivation(plugin_id, &reason);
                self.blacklist(plugin_id, &reason).await;
            }
            Consequence::Deactivate => {
                warn!(plugin_id = %plugin_id, %reason, prior, "Deactivating plugin after repeated warnings");
                self.request_deactivation(plugin_id, &reason);
            }
            Consequence::Throttle => {
                warn!(plugin_id = %plugin_id, %reason, prior, "Throttling plugin");
                self.resources.restrict(plugin_id).await;
            }
            Consequence::Monitor => {
                info!(plugin_id = %plugin_id, %reason, "Monitoring plugin");
                self.inner.write().await.monitored.insert(plugin_id.to_string());
            }
            Consequence::LogOnly => {
                info!(plugin_id = %plugin_id, %reason, "Security event logged");
            }
        }
    }

    fn request_deactivation(&self, plugin_id: &str, reason: &str) {
        if self
            .actions
            .send(SecurityAction::Deactivate {
                plugin_id: plugin_id.to_string(),
                reason: reason.to_string(),
            })
            .is_err()
        {
            warn!(plugin_id = %plugin_id, "No receiver for deactivation request");
        }
    }

    /// 0-100, lower is riskier
    pub async fn security_score(&self, plugin_id: &str) -> u32 {
        let warning_penalty: u32 = self
            .inner
            .read()
            .await
            .warnings
            .get(plugin_id)
            .map(|w| {
                w.by_severity
                    .iter()
                    .map(|(severity, count)| severity_penalty(*severity) * count)
                    .sum()
            })
            .unwrap_or(0);
        let held_penalty: u32 = self
            .permissions
            .approved(plugin_id)
            .await
            .iter()
            .map(|p| permission_penalty(p))
            .sum();

        100u32.saturating_sub(warning_penalty.saturating_add(held_penalty))
    }

    pub async fn warnings(&self, plugin_id: &str) -> u32 {
        self.inner
            .read()
            .await
            .warnings
            .get(plugin_id)
            .map(|w| w.total)
            .unwrap_or(0)
    }

    pub async fn is_monitored(&self, plugin_id: &str) -> bool {
        self.inner.read().await.monitored.contains(plugin_id)
    }

    pub async fn stats(&self) -> SecurityStats {
        let restricted = self.resources.restricted_plugins().await;
        let inner = self.inner.read().await;
        SecurityStats {
            level: inner.level,
            checks: inner.checks.clone(),
            blacklisted: inner.blacklist.len(),
            total_events: inner.total_events,
            events_by_severity: inner.events_by_severity.clone(),
            warnings: inner
                .warnings
                .iter()
                .map(|(id, w)| (id.clone(), w.total))
                .collect(),
            restricted,
            monitored: inner.monitored.iter().cloned().collect(),
        }
    }
}

#[async_trait]
impl EventSubscriber for SecurityManager {
    async fn handle(&self, event: &PluginEvent) -> Result<()> {
        self.report_signal(event.topic, event.plugin_id.as_deref(), &event.data)
            .await;
        Ok(())
    }

    fn subscribed_topics(&self) -> &[Topic] {
        SIGNAL_TOPICS
    }
}
