//! Resource monitor
//!
//! Per-plugin operation counters checked against per-minute quotas that
//! depend on the security level. A violation restricts the plugin, scaling
//! every quota by the restriction factor until it is explicitly unrestricted.
//! Counters roll into a bounded history on a fixed interval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::security::SecurityAction;
use warden_core::config::WardenConfig;
use warden_core::events::{EventBus, PluginEvent, Topic};
use warden_core::policy::SecurityLevel;

/// Violations kept per plugin
const VIOLATION_HISTORY: usize = 100;

/// Overage ratio above which a violation is severe
pub const SEVERE_RATIO: f64 = 2.0;

/// What a tracked operation counts against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ApiCall,
    NetworkRequest,
    DomOperation,
    StorageOperation,
    /// Activation and teardown: only CPU time and the total count
    Lifecycle,
}

impl OperationKind {
    /// Kind derived from a host method's namespace
    pub fn for_method(method: &str) -> Self {
        match method.split('.').next() {
            Some("network") => Self::NetworkRequest,
            Some("dom") => Self::DomOperation,
            Some("storage") => Self::StorageOperation,
            _ => Self::ApiCall,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ApiCalls,
    NetworkRequests,
    DomOperations,
    StorageOperations,
    CpuTimeMs,
    TotalOperations,
    MemoryMb,
    StorageMb,
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Self::ApiCalls,
        Self::NetworkRequests,
        Self::DomOperations,
        Self::StorageOperations,
        Self::CpuTimeMs,
        Self::TotalOperations,
        Self::MemoryMb,
        Self::StorageMb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiCalls => "api_calls",
            Self::NetworkRequests => "network_requests",
            Self::DomOperations => "dom_operations",
            Self::StorageOperations => "storage_operations",
            Self::CpuTimeMs => "cpu_time_ms",
            Self::TotalOperations => "total_operations",
            Self::MemoryMb => "memory_mb",
            Self::StorageMb => "storage_mb",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Counters for the current window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub api_calls: u64,
    pub network_requests: u64,
    pub dom_operations: u64,
    pub storage_operations: u64,
    pub cpu_time_ms: u64,
    pub total_operations: u64,
}

/// Quotas for one plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub api_calls_per_minute: f64,
    pub network_requests_per_minute: f64,
    pub dom_operations_per_minute: f64,
    pub storage_operations_per_minute: f64,
    pub cpu_time_ms_per_minute: f64,
    pub total_operations_per_minute: f64,
    pub memory_mb: f64,
    pub storage_mb: f64,
}

impl ResourceLimits {
    pub fn for_level(level: SecurityLevel) -> Self {
        match level {
            SecurityLevel::Low => Self {
                api_calls_per_minute: 1000.0,
                network_requests_per_minute: 200.0,
                dom_operations_per_minute: 2000.0,
                storage_operations_per_minute: 500.0,
                cpu_time_ms_per_minute: 30_000.0,
                total_operations_per_minute: 5000.0,
                memory_mb: 100.0,
                storage_mb: 10.0,
            },
            SecurityLevel::Normal => Self {
                api_calls_per_minute: 500.0,
                network_requests_per_minute: 100.0,
                dom_operations_per_minute: 1000.0,
                storage_operations_per_minute: 250.0,
                cpu_time_ms_per_minute: 15_000.0,
                total_operations_per_minute: 2500.0,
                memory_mb: 50.0,
                storage_mb: 5.0,
            },
            SecurityLevel::High => Self {
                api_calls_per_minute: 200.0,
                network_requests_per_minute: 50.0,
                dom_operations_per_minute: 500.0,
                storage_operations_per_minute: 100.0,
                cpu_time_ms_per_minute: 5000.0,
                total_operations_per_minute: 1000.0,
                memory_mb: 25.0,
                storage_mb: 2.0,
            },
        }
    }

    /// Every quota multiplied by `factor`
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            api_calls_per_minute: self.api_calls_per_minute * factor,
            network_requests_per_minute: self.network_requests_per_minute * factor,
            dom_operations_per_minute: self.dom_operations_per_minute * factor,
            storage_operations_per_minute: self.storage_operations_per_minute * factor,
            cpu_time_ms_per_minute: self.cpu_time_ms_per_minute * factor,
            total_operations_per_minute: self.total_operations_per_minute * factor,
            memory_mb: self.memory_mb * factor,
            storage_mb: self.storage_mb * factor,
        }
    }

    pub fn limit(&self, metric: Metric) -> f64 {
        match metric {
            Metric::ApiCalls => self.api_calls_per_minute,
            Metric::NetworkRequests => self.network_requests_per_minute,
            Metric::DomOperations => self.dom_operations_per_minute,
            Metric::StorageOperations => self.storage_operations_per_minute,
            Metric::CpuTimeMs => self.cpu_time_ms_per_minute,
            Metric::TotalOperations => self.total_operations_per_minute,
            Metric::MemoryMb => self.memory_mb,
            Metric::StorageMb => self.storage_mb,
        }
    }
}

/// A quota breach
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub metric: Metric,
    pub value: f64,
    /// Effective limit at the time of the breach
    pub limit: f64,
    /// Usage over the unrestricted quota for the level
    pub ratio: f64,
    pub severe: bool,
    pub timestamp: DateTime<Utc>,
}

/// A closed counting window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub counters: UsageCounters,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Point-in-time view of a plugin's usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub plugin_id: String,
    pub current: UsageCounters,
    pub window_started: DateTime<Utc>,
    pub history: Vec<WindowSnapshot>,
    pub memory_mb: f64,
    pub storage_mb: f64,
    pub violations: Vec<Violation>,
    pub restricted: bool,
    pub limits: ResourceLimits,
}

#[derive(Debug)]
struct PluginUsage {
    counters: UsageCounters,
    window_started: DateTime<Utc>,
    history: VecDeque<WindowSnapshot>,
    memory_mb: f64,
    storage_mb: f64,
    violations: VecDeque<Violation>,
    /// Highest tier recorded per metric this window (`true` = severe)
    recorded: HashMap<Metric, bool>,
    restricted: bool,
}

impl PluginUsage {
    fn new() -> Self {
        Self {
            counters: UsageCounters::default(),
            window_started: Utc::now(),
            history: VecDeque::new(),
            memory_mb: 0.0,
            storage_mb: 0.0,
            violations: VecDeque::new(),
            recorded: HashMap::new(),
            restricted: false,
        }
    }

    fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::ApiCalls => self.counters.api_calls as f64,
            Metric::NetworkRequests => self.counters.network_requests as f64,
            Metric::DomOperations => self.counters.dom_operations as f64,
            Metric::StorageOperations => self.counters.storage_operations as f64,
            Metric::CpuTimeMs => self.counters.cpu_time_ms as f64,
            Metric::TotalOperations => self.counters.total_operations as f64,
            Metric::MemoryMb => self.memory_mb,
            Metric::StorageMb => self.storage_mb,
        }
    }
}

struct Inner {
    usage: HashMap<String, PluginUsage>,
    level: SecurityLevel,
    enabled: bool,
}

pub struct ResourceMonitor {
    bus: Arc<EventBus>,
    inner: RwLock<Inner>,
    restriction_factor: f64,
    history_len: usize,
    reset_interval: Duration,
    actions: Option<mpsc::UnboundedSender<SecurityAction>>,
}

impl ResourceMonitor {
    pub fn new(bus: Arc<EventBus>, config: &WardenConfig) -> Self {
        Self {
            bus,
            inner: RwLock::new(Inner {
                usage: HashMap::new(),
                level: config.security.level,
                enabled: config.security.checks.resource_monitoring,
            }),
            restriction_factor: config.resources.restriction_factor,
            history_len: config.resources.history_len,
            reset_interval: Duration::from_secs(config.resources.reset_interval_secs),
            actions: None,
        }
    }

    /// Route deactivation requests to the manager
    pub fn with_actions(mut self, actions: mpsc::UnboundedSender<SecurityAction>) -> Self {
        self.actions = Some(actions);
        self
    }

    pub async fn set_security_level(&self, level: SecurityLevel) {
        self.inner.write().await.level = level;
    }

    pub async fn security_level(&self) -> SecurityLevel {
        self.inner.read().await.level
    }

    /// Toggle limit checking; counting continues either way
    pub async fn set_enabled(&self, enabled: bool) {
        self.inner.write().await.enabled = enabled;
    }

    /// Count an operation and start its clock
    pub async fn track_operation(
        self: &Arc<Self>,
        plugin_id: &str,
        kind: OperationKind,
    ) -> OperationGuard {
        {
            let mut inner = self.inner.write().await;
            let usage = inner
                .usage
                .entry(plugin_id.to_string())
                .or_insert_with(PluginUsage::new);
            let counters = &mut usage.counters;
            match kind {
                OperationKind::ApiCall => counters.api_calls += 1,
                OperationKind::NetworkRequest => counters.network_requests += 1,
                OperationKind::DomOperation => counters.dom_operations += 1,
                OperationKind::StorageOperation => counters.storage_operations += 1,
                OperationKind::Lifecycle => {}
            }
            counters.total_operations += 1;
        }

        OperationGuard {
            monitor: Arc::clone(self),
            plugin_id: plugin_id.to_string(),
            kind,
            started: Instant::now(),
        }
    }

    async fn finish_operation(&self, plugin_id: &str, elapsed: Duration) -> Vec<Violation> {
        {
            let mut inner = self.inner.write().await;
            if let Some(usage) = inner.usage.get_mut(plugin_id) {
                usage.counters.cpu_time_ms += elapsed.as_millis() as u64;
            }
        }
        self.check_limits(plugin_id).await
    }

    /// Report a memory gauge reading
    pub async fn set_memory_usage(&self, plugin_id: &str, megabytes: f64) -> Vec<Violation> {
        {
            let mut inner = self.inner.write().await;
            inner
                .usage
                .entry(plugin_id.to_string())
                .or_insert_with(PluginUsage::new)
                .memory_mb = megabytes;
        }
        self.check_limits(plugin_id).await
    }

    /// Report a storage gauge reading
    pub async fn set_storage_usage(&self, plugin_id: &str, megabytes: f64) -> Vec<Violation> {
        {
            let mut inner = self.inner.write().await;
            inner
                .usage
                .entry(plugin_id.to_string())
                .or_insert_with(PluginUsage::new)
                .storage_mb = megabytes;
        }
        self.check_limits(plugin_id).await
    }

    fn effective_limits(&self, level: SecurityLevel, restricted: bool) -> ResourceLimits {
        let limits = ResourceLimits::for_level(level);
        if restricted {
            limits.scaled(self.restriction_factor)
        } else {
            limits
        }
    }

    /// Compare current usage with quotas, recording new violations
    ///
    /// Each metric is recorded at most once per window, plus once more if it
    /// later becomes severe.
    pub async fn check_limits(&self, plugin_id: &str) -> Vec<Violation> {
        let (violations, newly_restricted, level) = {
            let mut inner = self.inner.write().await;
            if !inner.enabled {
                return Vec::new();
            }
            let level = inner.level;
            let Some(usage) = inner.usage.get_mut(plugin_id) else {
                return Vec::new();
            };
            let limits = self.effective_limits(level, usage.restricted);
            let base = ResourceLimits::for_level(level);

            let mut found = Vec::new();
            for metric in Metric::ALL {
                let limit = limits.limit(metric);
                let value = usage.value(metric);
                if limit <= 0.0 || value <= limit {
                    continue;
                }
                // Severity is measured against the unrestricted quota
                let base_limit = base.limit(metric);
                let ratio = if base_limit > 0.0 { value / base_limit } else { value / limit };
                let severe = ratio > SEVERE_RATIO;
                let already = usage.recorded.get(&metric).copied();
                if already == Some(true) || (already == Some(false) && !severe) {
                    continue;
                }
                usage.recorded.insert(metric, severe);
                found.push(Violation {
                    metric,
                    value,
                    limit,
                    ratio,
                    severe,
                    timestamp: Utc::now(),
                });
            }

            for violation in &found {
                if usage.violations.len() == VIOLATION_HISTORY {
                    usage.violations.pop_front();
                }
                usage.violations.push_back(violation.clone());
            }

            let newly_restricted = !found.is_empty() && !usage.restricted;
            if !found.is_empty() {
                usage.restricted = true;
            }
            (found, newly_restricted, level)
        };

        for violation in &violations {
            warn!(
                plugin_id = %plugin_id,
                metric = %violation.metric,
                value = violation.value,
                limit = violation.limit,
                "Resource limit exceeded"
            );
            self.bus
                .publish(PluginEvent::for_plugin(
                    Topic::ResourceViolation,
                    plugin_id,
                    json!({
                        "metric": violation.metric,
                        "value": violation.value,
                        "limit": violation.limit,
                        "ratio": violation.ratio,
                        "severe": violation.severe,
                    }),
                ))
                .await;
        }

        if newly_restricted {
            self.bus
                .publish(PluginEvent::for_plugin(
                    Topic::ResourceRestricted,
                    plugin_id,
                    json!({ "restricted": true, "factor": self.restriction_factor }),
                ))
                .await;
        }

        if level == SecurityLevel::High {
            if let Some(severe) = violations.iter().find(|v| v.severe) {
                let reason = format!(
                    "{} at {:.1}x its limit",
                    severe.metric, severe.ratio
                );
                warn!(plugin_id = %plugin_id, %reason, "Requesting deactivation for severe overage");
                self.bus
                    .publish(PluginEvent::for_plugin(
                        Topic::ResourceDeactivationRequested,
                        plugin_id,
                        json!({ "metric": severe.metric, "ratio": severe.ratio, "reason": reason }),
                    ))
                    .await;
                if let Some(actions) = &self.actions {
                    if actions
                        .send(SecurityAction::Deactivate {
                            plugin_id: plugin_id.to_string(),
                            reason,
                        })
                        .is_err()
                    {
                        warn!(plugin_id = %plugin_id, "No receiver for deactivation request");
                    }
                }
            }
        }

        violations
    }

    /// Scale a plugin's quotas down
    pub async fn restrict(&self, plugin_id: &str) {
        let changed = {
            let mut inner = self.inner.write().await;
            let usage = inner
                .usage
                .entry(plugin_id.to_string())
                .or_insert_with(PluginUsage::new);
            !std::mem::replace(&mut usage.restricted, true)
        };
        if changed {
            info!(plugin_id = %plugin_id, "Plugin restricted");
            self.bus
                .publish(PluginEvent::for_plugin(
                    Topic::ResourceRestricted,
                    plugin_id,
                    json!({ "restricted": true, "factor": self.restriction_factor }),
                ))
                .await;
        }
    }

    /// Lift a restriction; the only way to clear the flag
    pub async fn unrestrict(&self, plugin_id: &str) -> bool {
        let changed = {
            let mut inner = self.inner.write().await;
            inner
                .usage
                .get_mut(plugin_id)
                .is_some_and(|u| std::mem::replace(&mut u.restricted, false))
        };
        if changed {
            info!(plugin_id = %plugin_id, "Plugin restriction lifted");
            self.bus
                .publish(PluginEvent::for_plugin(
                    Topic::ResourceRestricted,
                    plugin_id,
                    json!({ "restricted": false }),
                ))
                .await;
        }
        changed
    }

    pub async fn is_restricted(&self, plugin_id: &str) -> bool {
        self.inner
            .read()
            .await
            .usage
            .get(plugin_id)
            .is_some_and(|u| u.restricted)
    }

    pub async fn restricted_plugins(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .read()
            .await
            .usage
            .iter()
            .filter(|(_, u)| u.restricted)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn violations(&self, plugin_id: &str) -> Vec<Violation> {
        self.inner
            .read()
            .await
            .usage
            .get(plugin_id)
            .map(|u| u.violations.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn snapshot(&self, plugin_id: &str) -> Option<UsageSnapshot> {
        let inner = self.inner.read().await;
        let usage = inner.usage.get(plugin_id)?;
        Some(UsageSnapshot {
            plugin_id: plugin_id.to_string(),
            current: usage.counters.clone(),
            window_started: usage.window_started,
            history: usage.history.iter().cloned().collect(),
            memory_mb: usage.memory_mb,
            storage_mb: usage.storage_mb,
            violations: usage.violations.iter().cloned().collect(),
            restricted: usage.restricted,
            limits: self.effective_limits(inner.level, usage.restricted),
        })
    }

    /// Close the current window for every plugin
    pub async fn reset_counters(&self) {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        for usage in inner.usage.values_mut() {
            if self.history_len > 0 {
                if usage.history.len() >= self.history_len {
                    usage.history.pop_front();
                }
                usage.history.push_back(WindowSnapshot {
                    counters: std::mem::take(&mut usage.counters),
                    started_at: usage.window_started,
                    ended_at: now,
                });
            } else {
                usage.counters = UsageCounters::default();
            }
            usage.window_started = now;
            usage.recorded.clear();
        }
        debug!(plugins = inner.usage.len(), "Resource counters reset");
    }

    /// Forget a plugin entirely
    pub async fn remove(&self, plugin_id: &str) {
        self.inner.write().await.usage.remove(plugin_id);
    }

    /// Reset counters every interval until cancelled
    pub fn spawn_reset_loop(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.reset_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => monitor.reset_counters().await,
                }
            }
            debug!("Resource reset loop stopped");
        })
    }
}

/// Completion handle returned by [`ResourceMonitor::track_operation`]
pub struct OperationGuard {
    monitor: Arc<ResourceMonitor>,
    plugin_id: String,
    kind: OperationKind,
    started: Instant,
}

impl OperationGuard {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Accumulate elapsed time and check limits
    pub async fn complete(self) -> Vec<Violation> {
        let elapsed = self.started.elapsed();
        self.monitor
            .finish_operation(&self.plugin_id, elapsed)
            .await
    }
}
