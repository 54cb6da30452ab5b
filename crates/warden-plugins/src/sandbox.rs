//! Cooperative sandbox
//!
//! Two guards, neither of them an isolation boundary:
//! - Static analysis: the serialized descriptor is matched against ordered,
//!   severity-tagged patterns; the security level decides which severities
//!   fail the plugin.
//! - Monitored execution: plugin futures run on a spawned task raced against
//!   a level-dependent timeout. A timeout abandons the wait; the task itself
//!   keeps running.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::PluginManifest;
use crate::api::HostApi;
use crate::registry::{Phase, PluginExecutor};
use warden_core::config::WardenConfig;
use warden_core::events::{EventBus, PluginEvent, Topic};
use warden_core::policy::{SecurityLevel, Severity};
use warden_core::{Error, Result};

/// Failures kept per plugin
const ERROR_LOG_CAPACITY: usize = 50;

/// Ordered (severity, description, pattern) analysis rules
const RULES: &[(Severity, &str, &str)] = &[
    (Severity::Critical, "dynamic code evaluation", r"\beval\s*\("),
    (Severity::Critical, "function constructor", r"new\s+Function\s*\("),
    (Severity::Critical, "child process spawning", r"child_process"),
    (Severity::Critical, "process spawning", r"std::process::Command"),
    (Severity::Critical, "recursive deletion", r"rm\s+-rf"),
    (Severity::High, "cookie access", r"document\.cookie"),
    (Severity::High, "prototype tampering", r"__proto__"),
    (Severity::High, "environment access", r"process\.env"),
    (Severity::High, "unsafe block", r"\bunsafe\s*\{"),
    (Severity::High, "system file access", r"/etc/passwd"),
    (Severity::Medium, "local storage access", r"localStorage"),
    (Severity::Medium, "raw HTTP request", r"XMLHttpRequest"),
    (Severity::Medium, "fetch call", r"\bfetch\s*\("),
    (Severity::Medium, "websocket", r"\bWebSocket\b"),
    (Severity::Low, "inner HTML assignment", r"innerHTML"),
    (Severity::Low, "string timer", r#"setTimeout\s*\(\s*["']"#),
];

/// Execution timeout at each level
pub fn timeout_for(level: SecurityLevel) -> Duration {
    match level {
        SecurityLevel::Low => Duration::from_secs(10),
        SecurityLevel::Normal => Duration::from_secs(5),
        SecurityLevel::High => Duration::from_secs(2),
    }
}

/// Whether a finding of `severity` fails analysis at `level`
pub fn blocks_at(level: SecurityLevel, severity: Severity) -> bool {
    match level {
        SecurityLevel::Low => severity == Severity::Critical,
        SecurityLevel::Normal => severity >= Severity::High,
        SecurityLevel::High => true,
    }
}

struct AnalysisRule {
    severity: Severity,
    description: &'static str,
    pattern: Regex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub rule: String,
    pub severity: Severity,
    pub matched: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub plugin_id: String,
    /// SHA-256 of the analysed text
    pub fingerprint: String,
    pub level: SecurityLevel,
    pub passed: bool,
    /// Findings that count at `level`
    pub findings: Vec<Finding>,
    /// Findings below the level's threshold
    pub ignored: Vec<Finding>,
    pub skipped: bool,
    pub analyzed_at: DateTime<Utc>,
}

/// A captured plugin failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub label: String,
    pub message: String,
    pub timed_out: bool,
    pub timestamp: DateTime<Utc>,
}

struct Inner {
    level: SecurityLevel,
    static_analysis: bool,
    timeouts: bool,
    errors: HashMap<String, VecDeque<ExecutionFailure>>,
    reports: HashMap<(String, SecurityLevel), AnalysisReport>,
}

pub struct Sandbox {
    bus: Arc<EventBus>,
    rules: Vec<AnalysisRule>,
    inner: RwLock<Inner>,
}

impl Sandbox {
    pub fn new(bus: Arc<EventBus>, config: &WardenConfig) -> Self {
        let rules = RULES
            .iter()
            .filter_map(|(severity, description, pattern)| match Regex::new(pattern) {
                Ok(pattern) => Some(AnalysisRule {
                    severity: *severity,
                    description: *description,
                    pattern,
                }),
                Err(e) => {
                    warn!(rule = %description, error = %e, "Skipping invalid analysis rule");
                    None
                }
            })
            .collect();

        Self {
            bus,
            rules,
            inner: RwLock::new(Inner {
                level: config.security.level,
                static_analysis: config.security.checks.static_analysis,
                timeouts: config.security.checks.execution_timeouts,
                errors: HashMap::new(),
                reports: HashMap::new(),
            }),
        }
    }

    pub async fn set_security_level(&self, level: SecurityLevel) {
        self.inner.write().await.level = level;
    }

    pub async fn security_level(&self) -> SecurityLevel {
        self.inner.read().await.level
    }

    pub async fn set_static_analysis(&self, enabled: bool) {
        self.inner.write().await.static_analysis = enabled;
    }

    pub async fn set_timeouts(&self, enabled: bool) {
        self.inner.write().await.timeouts = enabled;
    }

    /// Freeze the host's core method table at high level
    ///
    /// A tamper guard against late re-registration, nothing more.
    pub async fn harden(&self, api: &HostApi) -> bool {
        if self.security_level().await == SecurityLevel::High {
            api.freeze();
            debug!("Core host API frozen");
            true
        } else {
            false
        }
    }

    fn fingerprint(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Match the serialized descriptor against every rule
    pub async fn analyze(&self, manifest: &PluginManifest) -> Result<AnalysisReport> {
        let text = serde_json::to_string(manifest)?;
        let fingerprint = Self::fingerprint(&text);
        let (level, enabled) = {
            let inner = self.inner.read().await;
            (inner.level, inner.static_analysis)
        };

        if !enabled {
            return Ok(AnalysisReport {
                plugin_id: manifest.id.clone(),
                fingerprint,
                level,
                passed: true,
                findings: Vec::new(),
                ignored: Vec::new(),
                skipped: true,
                analyzed_at: Utc::now(),
            });
        }

        let key = (fingerprint.clone(), level);
        if let Some(report) = self.inner.read().await.reports.get(&key) {
            if report.plugin_id == manifest.id {
                return Ok(report.clone());
            }
        }

        let (findings, ignored): (Vec<Finding>, Vec<Finding>) = self
            .rules
            .iter()
            .filter_map(|rule| {
                rule.pattern.find(&text).map(|m| Finding {
                    rule: rule.description.to_string(),
                    severity: rule.severity,
                    matched: m.as_str().to_string(),
                })
            })
            .partition(|f| blocks_at(level, f.severity));

        let report = AnalysisReport {
            plugin_id: manifest.id.clone(),
            fingerprint,
            level,
            passed: findings.is_empty(),
            findings,
            ignored,
            skipped: false,
            analyzed_at: Utc::now(),
        };

        self.inner.write().await.reports.insert(key, report.clone());

        if !report.passed {
            let worst = report
                .findings
                .iter()
                .map(|f| f.severity)
                .max()
                .unwrap_or(Severity::Low);
            warn!(plugin_id = %manifest.id, findings = report.findings.len(), "Static analysis failed");
            self.bus
                .publish(PluginEvent::for_plugin(
                    Topic::StaticAnalysisFailed,
                    &manifest.id,
                    json!({
                        "fingerprint": report.fingerprint,
                        "severity": worst,
                        "findings": report.findings,
                    }),
                ))
                .await;
        }

        Ok(report)
    }

    /// Run plugin code on its own task, bounded by the level's timeout
    ///
    /// Errors, panics and timeouts are logged against the plugin, published,
    /// and returned as [`Error::PluginFailed`] or [`Error::Timeout`].
    pub async fn execute_sandboxed<T, F>(&self, plugin_id: &str, label: &str, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (level, timeouts) = {
            let inner = self.inner.read().await;
            (inner.level, inner.timeouts)
        };

        let handle = tokio::spawn(task);
        let joined = if timeouts {
            let limit = timeout_for(level);
            match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    let millis = limit.as_millis() as u64;
                    self.record_failure(plugin_id, label, format!("timed out after {} ms", millis), true)
                        .await;
                    self.bus
                        .publish(PluginEvent::for_plugin(
                            Topic::SandboxTimeout,
                            plugin_id,
                            json!({ "label": label, "timeout_ms": millis }),
                        ))
                        .await;
                    return Err(Error::Timeout(plugin_id.to_string(), millis));
                }
            }
        } else {
            handle.await
        };

        let message = match joined {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => format!("{:#}", e),
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                format!("panicked: {}", detail)
            }
            Err(e) => format!("task aborted: {}", e),
        };

        self.record_failure(plugin_id, label, message.clone(), false).await;
        self.bus
            .publish(PluginEvent::for_plugin(
                Topic::SandboxError,
                plugin_id,
                json!({ "label": label, "message": message }),
            ))
            .await;
        Err(Error::PluginFailed(plugin_id.to_string(), message))
    }

    async fn record_failure(&self, plugin_id: &str, label: &str, message: String, timed_out: bool) {
        warn!(plugin_id = %plugin_id, %label, %message, timed_out, "Sandboxed execution failed");
        let mut inner = self.inner.write().await;
        let log = inner.errors.entry(plugin_id.to_string()).or_default();
        if log.len() == ERROR_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(ExecutionFailure {
            label: label.to_string(),
            message,
            timed_out,
            timestamp: Utc::now(),
        });
    }

    /// Captured failures for a plugin, oldest first
    pub async fn errors(&self, plugin_id: &str) -> Vec<ExecutionFailure> {
        self.inner
            .read()
            .await
            .errors
            .get(plugin_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn clear_errors(&self, plugin_id: &str) {
        self.inner.write().await.errors.remove(plugin_id);
    }

    /// Drop cached analysis reports
    pub async fn clear_reports(&self) {
        self.inner.write().await.reports.clear();
    }
}

#[async_trait]
impl PluginExecutor for Sandbox {
    async fn execute(
        &self,
        plugin_id: &str,
        phase: Phase,
        task: BoxFuture<'static, anyhow::Result<bool>>,
    ) -> Result<bool> {
        self.execute_sandboxed(plugin_id, phase.as_str(), task).await
    }
}
