//! Audit log
//!
//! Append-only, capacity-bounded journal of security-relevant decisions.
//! In immediate mode every entry is committed and persisted as it arrives; in
//! batch mode entries queue until the next flush. Either way the committed
//! log ends up the same.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use warden_core::config::WardenConfig;
use warden_core::events::{EventSubscriber, PluginEvent, Topic};
use warden_core::policy::{AuditMode, SecurityLevel, Severity};
use warden_core::storage::{AUDIT_LOG_KEY, KeyValueStore};
use warden_core::{Error, Result};

/// Topics the audit log records directly; security signals arrive through
/// the security manager instead
const AUDITED_TOPICS: &[Topic] = &[
    Topic::PluginRegistered,
    Topic::PluginUnregistered,
    Topic::PluginActivated,
    Topic::PluginDeactivated,
    Topic::PluginActivationFailed,
    Topic::CompatibilityChecked,
    Topic::ValidationCompleted,
    Topic::PermissionRequested,
    Topic::PermissionApproved,
    Topic::PermissionRejected,
    Topic::PermissionRevoked,
    Topic::ResourceRestricted,
    Topic::PluginBlacklisted,
    Topic::PluginWhitelisted,
    Topic::SecurityLevelChanged,
    Topic::SecurityCheckToggled,
];

/// Default capacity at each level
pub fn capacity_for(level: SecurityLevel) -> usize {
    match level {
        SecurityLevel::Low => 1000,
        SecurityLevel::Normal => 5000,
        SecurityLevel::High => 10_000,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    PermissionChange,
    SecurityEvent,
    SuspiciousActivity,
    ResourceOveruse,
    BlacklistAction,
    Lifecycle,
    Validation,
    Other,
}

impl AuditCategory {
    pub const ALL: [AuditCategory; 8] = [
        Self::PermissionChange,
        Self::SecurityEvent,
        Self::SuspiciousActivity,
        Self::ResourceOveruse,
        Self::BlacklistAction,
        Self::Lifecycle,
        Self::Validation,
        Self::Other,
    ];

    /// Category for an originating event name
    pub fn from_event(name: &str) -> Self {
        match name {
            "permission.denied" | "sandbox.analysis_failed" => Self::SuspiciousActivity,
            n if n.starts_with("permission.") => Self::PermissionChange,
            n if n.starts_with("resource.") => Self::ResourceOveruse,
            n if n.starts_with("blacklist.") => Self::BlacklistAction,
            n if n.starts_with("plugin.") && n != "plugin.message" => Self::Lifecycle,
            n if n.starts_with("compatibility.") || n.starts_with("validation.") => Self::Validation,
            n if n.starts_with("security.") || n.starts_with("sandbox.") => Self::SecurityEvent,
            _ => Self::Other,
        }
    }

    /// Severity for entries that carry none of their own
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::SuspiciousActivity | Self::BlacklistAction => Severity::High,
            Self::ResourceOveruse | Self::SecurityEvent => Severity::Medium,
            _ => Severity::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionChange => "permission_change",
            Self::SecurityEvent => "security_event",
            Self::SuspiciousActivity => "suspicious_activity",
            Self::ResourceOveruse => "resource_overuse",
            Self::BlacklistAction => "blacklist_action",
            Self::Lifecycle => "lifecycle",
            Self::Validation => "validation",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AuditCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown audit category: {}", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    /// Originating event name
    pub event: String,
    pub plugin_id: Option<String>,
    pub severity: Severity,
    pub details: Value,
}

impl AuditEntry {
    pub fn new(event: &str, plugin_id: Option<String>, severity: Severity, details: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            category: AuditCategory::from_event(event),
            event: event.to_string(),
            plugin_id,
            severity,
            details,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub plugin_id: Option<String>,
    pub category: Option<AuditCategory>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Most recent `limit` matches
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        self.category.is_none_or(|c| c == entry.category)
            && self.since.is_none_or(|t| entry.timestamp >= t)
            && self.until.is_none_or(|t| entry.timestamp <= t)
    }
}

struct Inner {
    entries: VecDeque<AuditEntry>,
    by_plugin: HashMap<String, VecDeque<Uuid>>,
    queue: Vec<AuditEntry>,
    level: SecurityLevel,
    mode: AuditMode,
    mode_override: Option<AuditMode>,
    capacity: usize,
    capacity_override: Option<usize>,
}

impl Inner {
    fn commit(&mut self, entry: AuditEntry) {
        while self.entries.len() >= self.capacity.max(1) {
            self.evict_oldest();
        }
        if let Some(plugin) = &entry.plugin_id {
            self.by_plugin
                .entry(plugin.clone())
                .or_default()
                .push_back(entry.id);
        }
        self.entries.push_back(entry);
    }

    fn evict_oldest(&mut self) {
        let Some(evicted) = self.entries.pop_front() else {
            return;
        };
        if let Some(plugin) = &evicted.plugin_id {
            if let Some(ids) = self.by_plugin.get_mut(plugin) {
                ids.pop_front();
                if ids.is_empty() {
                    self.by_plugin.remove(plugin);
                }
            }
        }
    }
}

pub struct AuditLog {
    store: Arc<dyn KeyValueStore>,
    inner: RwLock<Inner>,
    batch_interval: Duration,
}

impl AuditLog {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &WardenConfig) -> Self {
        let level = config.security.level;
        Self {
            store,
            inner: RwLock::new(Inner {
                entries: VecDeque::new(),
                by_plugin: HashMap::new(),
                queue: Vec::new(),
                level,
                mode: config.audit.mode.unwrap_or_else(|| AuditMode::for_level(level)),
                mode_override: config.audit.mode,
                capacity: config.audit.capacity.unwrap_or_else(|| capacity_for(level)),
                capacity_override: config.audit.capacity,
            }),
            batch_interval: Duration::from_millis(config.audit.batch_interval_ms),
        }
    }

    /// Restore persisted entries (nothing is persisted at low level)
    pub async fn load(&self) -> Result<()> {
        if self.inner.read().await.level == SecurityLevel::Low {
            return Ok(());
        }
        let Some(value) = self.store.get(AUDIT_LOG_KEY).await? else {
            return Ok(());
        };
        let entries: Vec<AuditEntry> = serde_json::from_value(value)?;
        let mut inner = self.inner.write().await;
        for entry in entries {
            inner.commit(entry);
        }
        debug!(entries = inner.entries.len(), "Audit log restored");
        Ok(())
    }

    async fn persist(&self) -> bool {
        let snapshot: Vec<AuditEntry> = {
            let inner = self.inner.read().await;
            if inner.level == SecurityLevel::Low {
                return true;
            }
            inner.entries.iter().cloned().collect()
        };
        let result = match serde_json::to_value(&snapshot) {
            Ok(value) => self.store.set(AUDIT_LOG_KEY, value).await,
            Err(e) => Err(Error::from(e)),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to persist audit log");
                false
            }
        }
    }

    /// Append an entry according to the current mode
    pub async fn record(&self, entry: AuditEntry) {
        let immediate = {
            let mut inner = self.inner.write().await;
            match inner.mode {
                AuditMode::Immediate => {
                    inner.commit(entry);
                    true
                }
                AuditMode::Batch => {
                    inner.queue.push(entry);
                    false
                }
            }
        };
        if immediate {
            self.persist().await;
        }
    }

    /// Record a bus event with its category's default severity
    pub async fn record_event(&self, event: &PluginEvent) {
        let category = AuditCategory::from_event(event.name());
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            timestamp: event.timestamp,
            category,
            event: event.name().to_string(),
            plugin_id: event.plugin_id.clone(),
            severity: category.default_severity(),
            details: event.data.clone(),
        };
        self.record(entry).await;
    }

    /// Commit queued entries; returns how many were flushed
    pub async fn flush(&self) -> usize {
        let flushed = {
            let mut inner = self.inner.write().await;
            let queued = std::mem::take(&mut inner.queue);
            let count = queued.len();
            for entry in queued {
                inner.commit(entry);
            }
            count
        };
        if flushed > 0 {
            self.persist().await;
            debug!(flushed, "Audit queue flushed");
        }
        flushed
    }

    pub async fn pending(&self) -> usize {
        self.inner.read().await.queue.len()
    }

    pub async fn mode(&self) -> AuditMode {
        self.inner.read().await.mode
    }

    /// Pin the mode regardless of security level
    pub async fn set_mode(&self, mode: AuditMode) {
        {
            let mut inner = self.inner.write().await;
            inner.mode = mode;
            inner.mode_override = Some(mode);
        }
        if mode == AuditMode::Immediate {
            self.flush().await;
        }
    }

    /// Apply a new level's mode and capacity unless overridden
    pub async fn set_security_level(&self, level: SecurityLevel) {
        let mode = {
            let mut inner = self.inner.write().await;
            inner.level = level;
            inner.mode = inner.mode_override.unwrap_or_else(|| AuditMode::for_level(level));
            inner.capacity = inner.capacity_override.unwrap_or_else(|| capacity_for(level));
            while inner.entries.len() > inner.capacity.max(1) {
                inner.evict_oldest();
            }
            inner.mode
        };
        if mode == AuditMode::Immediate {
            self.flush().await;
        }
    }

    pub async fn capacity(&self) -> usize {
        self.inner.read().await.capacity
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    /// Committed entries matching `filter`, oldest first
    pub async fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let inner = self.inner.read().await;
        let mut matches: Vec<AuditEntry> = match &filter.plugin_id {
            Some(plugin) => {
                let ids: HashSet<&Uuid> = inner
                    .by_plugin
                    .get(plugin)
                    .map(|ids| ids.iter().collect())
                    .unwrap_or_default();
                inner
                    .entries
                    .iter()
                    .filter(|e| ids.contains(&e.id) && filter.matches(e))
                    .cloned()
                    .collect()
            }
            None => inner
                .entries
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect(),
        };
        if let Some(limit) = filter.limit {
            let skip = matches.len().saturating_sub(limit);
            matches.drain(..skip);
        }
        matches
    }

    /// Flush, then return every committed entry
    pub async fn export(&self) -> Vec<AuditEntry> {
        self.flush().await;
        self.inner.read().await.entries.iter().cloned().collect()
    }

    /// Drop every entry, queued or committed
    pub async fn clear(&self) {
        {
            let mut inner = self.inner.write().await;
            inner.entries.clear();
            inner.by_plugin.clear();
            inner.queue.clear();
        }
        self.persist().await;
    }

    /// Flush on the batch interval until cancelled
    pub fn spawn_flush_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let log = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(log.batch_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if log.mode().await == AuditMode::Batch {
                            log.flush().await;
                        }
                    }
                }
            }
            debug!("Audit flush loop stopped");
        })
    }
}

#[async_trait]
impl EventSubscriber for AuditLog {
    async fn handle(&self, event: &PluginEvent) -> Result<()> {
        self.record_event(event).await;
        Ok(())
    }

    fn subscribed_topics(&self) -> &[Topic] {
        AUDITED_TOPICS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use warden_core::storage::MemoryStore;

    fn log_with(mode: AuditMode, level: SecurityLevel) -> (Arc<MemoryStore>, AuditLog) {
        let mut config = WardenConfig::default();
        config.security.level = level;
        config.audit.mode = Some(mode);
        let store = Arc::new(MemoryStore::new());
        (store.clone(), AuditLog::new(store, &config))
    }

    fn sample(i: usize) -> AuditEntry {
        let plugin = if i % 2 == 0 { "even" } else { "odd" };
        AuditEntry::new(
            "permission.approved",
            Some(plugin.to_string()),
            Severity::Low,
            json!({ "n": i }),
        )
    }

    fn shape(entries: &[AuditEntry]) -> Vec<(AuditCategory, String, Option<String>, Severity, Value)> {
        entries
            .iter()
            .map(|e| (e.category, e.event.clone(), e.plugin_id.clone(), e.severity, e.details.clone()))
            .collect()
    }

    #[test]
    fn test_categorization() {
        assert_eq!(AuditCategory::from_event("permission.approved"), AuditCategory::PermissionChange);
        assert_eq!(AuditCategory::from_event("permission.denied"), AuditCategory::SuspiciousActivity);
        assert_eq!(AuditCategory::from_event("resource.violation"), AuditCategory::ResourceOveruse);
        assert_eq!(AuditCategory::from_event("blacklist.added"), AuditCategory::BlacklistAction);
        assert_eq!(AuditCategory::from_event("plugin.activated"), AuditCategory::Lifecycle);
        assert_eq!(AuditCategory::from_event("compatibility.checked"), AuditCategory::Validation);
        assert_eq!(AuditCategory::from_event("sandbox.timeout"), AuditCategory::SecurityEvent);
        assert_eq!(AuditCategory::from_event("plugin.message"), AuditCategory::Other);
    }

    #[tokio::test]
    async fn test_immediate_and_batch_modes_converge() {
        let (_, immediate) = log_with(AuditMode::Immediate, SecurityLevel::Normal);
        let (_, batch) = log_with(AuditMode::Batch, SecurityLevel::Normal);

        let entries: Vec<AuditEntry> = (0..25).map(sample).collect();
        for entry in &entries {
            immediate.record(entry.clone()).await;
            batch.record(entry.clone()).await;
        }

        assert_eq!(immediate.len().await, 25);
        assert_eq!(batch.len().await, 0);
        assert_eq!(batch.pending().await, 25);

        assert_eq!(batch.flush().await, 25);
        assert_eq!(immediate.export().await, batch.export().await);
        assert_eq!(shape(&immediate.export().await), shape(&entries));
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let mut config = WardenConfig::default();
        config.audit.mode = Some(AuditMode::Immediate);
        config.audit.capacity = Some(10);
        let log = AuditLog::new(Arc::new(MemoryStore::new()), &config);

        for i in 0..15 {
            log.record(sample(i)).await;
        }

        let all = log.export().await;
        assert_eq!(all.len(), 10);
        assert_eq!(all[0].details["n"], 5);

        let even = log
            .query(&AuditFilter {
                plugin_id: Some("even".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(even.len(), 5);
    }

    #[tokio::test]
    async fn test_query_filters() {
        let (_, log) = log_with(AuditMode::Immediate, SecurityLevel::Normal);
        for i in 0..6 {
            log.record(sample(i)).await;
        }
        log.record(AuditEntry::new("resource.violation", Some("odd".into()), Severity::Medium, json!({})))
            .await;

        let resource = log
            .query(&AuditFilter {
                category: Some(AuditCategory::ResourceOveruse),
                ..Default::default()
            })
            .await;
        assert_eq!(resource.len(), 1);

        let recent = log
            .query(&AuditFilter {
                plugin_id: Some("odd".into()),
                limit: Some(2),
                ..Default::default()
            })
            .await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].event, "resource.violation");

        let future = log
            .query(&AuditFilter {
                since: Some(Utc::now() + chrono::Duration::hours(1)),
                ..Default::default()
            })
            .await;
        assert!(future.is_empty());
    }

    #[tokio::test]
    async fn test_persistence_depends_on_level() {
        let (store, low) = log_with(AuditMode::Immediate, SecurityLevel::Low);
        low.record(sample(0)).await;
        assert!(store.get(AUDIT_LOG_KEY).await.unwrap().is_none());

        let (store, normal) = log_with(AuditMode::Immediate, SecurityLevel::Normal);
        normal.record(sample(0)).await;
        assert!(store.get(AUDIT_LOG_KEY).await.unwrap().is_some());

        let mut config = WardenConfig::default();
        config.audit.mode = Some(AuditMode::Immediate);
        let restored = AuditLog::new(store, &config);
        restored.load().await.unwrap();
        assert_eq!(restored.len().await, 1);
    }

    #[tokio::test]
    async fn test_switching_to_immediate_flushes() {
        let (_, log) = log_with(AuditMode::Batch, SecurityLevel::Normal);
        log.record(sample(1)).await;
        log.set_mode(AuditMode::Immediate).await;

        assert_eq!(log.pending().await, 0);
        assert_eq!(log.len().await, 1);

        log.clear().await;
        assert!(log.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_loop() {
        let mut config = WardenConfig::default();
        config.audit.mode = Some(AuditMode::Batch);
        config.audit.batch_interval_ms = 1000;
        let log = Arc::new(AuditLog::new(Arc::new(MemoryStore::new()), &config));
        log.record(sample(0)).await;

        let token = CancellationToken::new();
        let handle = log.spawn_flush_loop(token.clone());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(log.len().await, 1);

        token.cancel();
        handle.await.unwrap();
    }
}
