//! Security pipeline integration tests

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use warden_core::Error;
use warden_core::config::WardenConfig;
use warden_core::events::{PluginEvent, Topic};
use warden_core::policy::{AuditMode, SecurityLevel};
use warden_core::storage::{KeyValueStore, MemoryStore};
use warden_plugins::audit::{AuditCategory, AuditFilter, AuditLog};
use warden_plugins::permissions::{CATALOG, auto_approved};
use warden_plugins::resources::Metric;
use warden_plugins::{Plugin, PluginManager, api_handler};

async fn bare(level: SecurityLevel) -> PluginManager {
    start(config_at(level), Arc::new(MemoryStore::new()), vec![]).await
}

#[tokio::test]
async fn test_low_level_auto_approves_storage_and_dom() {
    let manager = bare(SecurityLevel::Low).await;
    let outcome = manager
        .permissions()
        .validate_permissions("p", &["storage".to_string(), "dom".to_string()])
        .await;

    assert_eq!(outcome.auto_approved, vec!["storage", "dom"]);
    assert!(outcome.pending.is_empty());
    assert!(manager.pending_permission_requests().await.is_empty());
}

#[tokio::test]
async fn test_high_level_leaves_storage_and_dom_pending() {
    let manager = bare(SecurityLevel::High).await;
    let outcome = manager
        .permissions()
        .validate_permissions("p", &["storage".to_string(), "dom".to_string()])
        .await;

    assert!(outcome.auto_approved.is_empty());
    assert_eq!(outcome.pending, vec!["storage", "dom"]);
    let pending = manager.pending_permission_requests().await;
    assert_eq!(pending.len(), 2);

    manager.approve_permission("p", "storage").await.unwrap();
    manager.reject_permission("p", "dom").await.unwrap();
    assert!(manager.permissions().has_permission("p", "storage").await);
    assert!(!manager.permissions().has_permission("p", "dom").await);
    assert!(manager.pending_permission_requests().await.is_empty());
}

#[tokio::test]
async fn test_low_only_grants_never_leak_into_high() {
    let manager = bare(SecurityLevel::High).await;
    let low_only: Vec<String> = auto_approved(SecurityLevel::Low)
        .iter()
        .filter(|p| !auto_approved(SecurityLevel::High).contains(*p))
        .map(|p| p.to_string())
        .collect();
    assert!(!low_only.is_empty());

    let outcome = manager.permissions().validate_permissions("p", &low_only).await;
    assert!(outcome.auto_approved.is_empty());
    for permission in &low_only {
        assert!(!manager.permissions().has_permission("p", permission).await);
    }

    // Every catalog entry is known to the checker
    let all: Vec<String> = CATALOG.iter().map(|p| p.name.to_string()).collect();
    let outcome = manager.permissions().validate_permissions("q", &all).await;
    assert!(outcome.invalid.is_empty());
}

#[tokio::test]
async fn test_revoked_permission_denies_calls() {
    let manager = bare(SecurityLevel::Normal).await;
    manager
        .permissions()
        .validate_permissions("p", &["storage".to_string()])
        .await;
    manager
        .call_api("p", "storage.set", json!({ "key": "k", "value": 1 }))
        .await
        .unwrap();

    manager.revoke_permission("p", "storage").await.unwrap();
    assert!(matches!(
        manager.call_api("p", "storage.get", json!({ "key": "k" })).await,
        Err(Error::PermissionDenied { .. })
    ));
    assert_eq!(
        manager.bus().events_by_topic(Topic::PermissionDenied).await.len(),
        1
    );
    assert!(manager.security().is_monitored("p").await);

    // Asking again leaves the revocation in place
    let outcome = manager
        .permissions()
        .validate_permissions("p", &["storage".to_string()])
        .await;
    assert_eq!(outcome.denied, vec!["storage"]);
    assert!(manager.pending_permission_requests().await.is_empty());
    assert!(
        manager
            .call_api("p", "storage.get", json!({ "key": "k" }))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_rejected_permission_stays_rejected() {
    let manager = bare(SecurityLevel::High).await;
    let network = vec!["network".to_string()];
    manager.permissions().validate_permissions("p", &network).await;
    manager.reject_permission("p", "network").await.unwrap();

    let outcome = manager.permissions().validate_permissions("p", &network).await;
    assert!(outcome.pending.is_empty());
    assert_eq!(outcome.denied, network);
    assert!(manager.pending_permission_requests().await.is_empty());
    assert!(manager.reject_permission("p", "network").await.is_err());
}

#[tokio::test]
async fn test_severe_overage_at_high_deactivates() {
    let manager = start(
        config_at(SecurityLevel::High),
        Arc::new(MemoryStore::new()),
        vec![Plugin::declarative(manifest("chatty").with_permissions(&["ui"]))],
    )
    .await;
    assert!(manager.activate_plugin("chatty").await);

    // 2.5x the high-level api call quota of 200
    for _ in 0..500 {
        let _ = manager
            .call_api("chatty", "ui.notify", json!({ "message": "tick" }))
            .await;
    }

    let violations = manager.resources().violations("chatty").await;
    assert!(violations.iter().any(|v| v.metric == Metric::ApiCalls && v.severe));
    assert!(manager.resources().is_restricted("chatty").await);
    assert!(
        !manager
            .bus()
            .events_by_topic(Topic::ResourceDeactivationRequested)
            .await
            .is_empty()
    );
    assert!(!manager.registry().is_active("chatty").await);
}

#[tokio::test]
async fn test_overage_restricts_exactly_once() {
    let manager = bare(SecurityLevel::Normal).await;
    manager
        .permissions()
        .validate_permissions("busy", &["ui".to_string()])
        .await;

    for _ in 0..700 {
        let _ = manager
            .call_api("busy", "ui.notify", json!({ "message": "tick" }))
            .await;
    }

    assert!(!manager.resources().violations("busy").await.is_empty());
    assert!(manager.resources().is_restricted("busy").await);
    let restricted_events = manager
        .bus()
        .events_for("busy")
        .await
        .into_iter()
        .filter(|e| e.topic == Topic::ResourceRestricted)
        .count();
    assert_eq!(restricted_events, 1);

    // A fresh window does not lift the flag
    manager.resources().reset_counters().await;
    assert!(manager.resources().is_restricted("busy").await);
    assert!(manager.resources().unrestrict("busy").await);
    assert!(!manager.resources().is_restricted("busy").await);
}

#[tokio::test]
async fn test_blacklisted_plugin_never_activates_until_whitelisted() {
    let manager = start(
        config_at(SecurityLevel::Low),
        Arc::new(MemoryStore::new()),
        vec![Plugin::declarative(manifest("shady"))],
    )
    .await;
    assert!(manager.activate_plugin("shady").await);

    assert!(manager.blacklist_plugin("shady", "phones home").await);
    assert!(!manager.registry().is_active("shady").await);

    // Relaxing every check does not help
    for check in ["compatibility", "static_analysis", "permission_enforcement"] {
        manager.toggle_check(check, false).await.unwrap();
    }
    for _ in 0..3 {
        assert!(!manager.activate_plugin("shady").await);
    }
    assert!(matches!(
        manager.try_activate_plugin("shady").await,
        Err(Error::Blacklisted(_))
    ));

    assert!(manager.whitelist_plugin("shady").await);
    assert!(manager.activate_plugin("shady").await);
}

#[tokio::test]
async fn test_dangerous_code_is_refused_and_blacklisted() {
    let manager = start(
        config_at(SecurityLevel::Normal),
        Arc::new(MemoryStore::new()),
        vec![Plugin::declarative(
            manifest("miner").with_code("const run = () => eval(atob(payload));"),
        )],
    )
    .await;

    assert!(matches!(
        manager.try_activate_plugin("miner").await,
        Err(Error::SecurityValidationFailed(..))
    ));
    assert!(manager.security().is_blacklisted("miner").await);
    assert!(matches!(
        manager.try_activate_plugin("miner").await,
        Err(Error::Blacklisted(_))
    ));

    let stats = manager.security_stats().await;
    assert_eq!(stats.blacklisted, 1);
    assert!(stats.total_events >= 1);
}

#[tokio::test]
async fn test_disabling_static_analysis_lets_flagged_code_through() {
    let manager = start(
        config_at(SecurityLevel::Normal),
        Arc::new(MemoryStore::new()),
        vec![Plugin::declarative(manifest("scraper").with_code("document.cookie"))],
    )
    .await;
    manager.toggle_check("static_analysis", false).await.unwrap();
    assert!(manager.activate_plugin("scraper").await);
}

#[tokio::test]
async fn test_high_level_freezes_core_api() {
    let manager = bare(SecurityLevel::High).await;
    assert!(manager.api().is_frozen());
    let late = manager.api().register_core(
        "ui.render",
        api_handler(|_call| async move { Ok(json!(null)) }),
    );
    assert!(late.is_err());

    let relaxed = bare(SecurityLevel::Normal).await;
    assert!(!relaxed.api().is_frozen());
    relaxed.set_security_level(SecurityLevel::High).await;
    assert!(relaxed.api().is_frozen());
}

#[tokio::test]
async fn test_level_change_propagates_and_persists() {
    let store = Arc::new(MemoryStore::new());
    let manager = start(config_at(SecurityLevel::Normal), store.clone(), vec![]).await;
    assert!(manager.set_security_level(SecurityLevel::Low).await);

    assert_eq!(manager.permissions().security_level().await, SecurityLevel::Low);
    assert_eq!(manager.resources().security_level().await, SecurityLevel::Low);
    assert_eq!(manager.sandbox().security_level().await, SecurityLevel::Low);

    let restarted = start(config_at(SecurityLevel::High), store.clone(), vec![]).await;
    assert_eq!(restarted.security().security_level().await, SecurityLevel::Low);
    assert!(
        restarted
            .bus()
            .events_by_topic(Topic::SecurityLevelChanged)
            .await
            .is_empty()
    );
}

#[tokio::test]
async fn test_audit_trail_records_lifecycle_and_permissions() {
    let manager = start(
        config_at(SecurityLevel::Normal),
        Arc::new(MemoryStore::new()),
        vec![Plugin::declarative(manifest("logged").with_permissions(&["ui", "network"]))],
    )
    .await;
    assert!(manager.activate_plugin("logged").await);
    manager.approve_permission("logged", "network").await.unwrap();
    manager.deactivate_plugin("logged", false).await;

    let entries = manager
        .audit_log(&AuditFilter {
            plugin_id: Some("logged".to_string()),
            ..Default::default()
        })
        .await;
    let events: Vec<&str> = entries.iter().map(|e| e.event.as_str()).collect();
    assert!(events.contains(&"plugin.activated"));
    assert!(events.contains(&"plugin.deactivated"));
    assert!(events.contains(&"permission.approved"));

    let permission_changes = manager
        .audit_log(&AuditFilter {
            category: Some(AuditCategory::PermissionChange),
            ..Default::default()
        })
        .await;
    assert!(!permission_changes.is_empty());

    manager.clear_audit_log().await;
    assert!(manager.audit_log(&AuditFilter::default()).await.is_empty());
}

#[tokio::test]
async fn test_audit_modes_converge_after_flush() {
    let events: Vec<PluginEvent> = (0..25)
        .map(|i| {
            let topic = match i % 3 {
                0 => Topic::PluginActivated,
                1 => Topic::PermissionApproved,
                _ => Topic::PluginBlacklisted,
            };
            PluginEvent::for_plugin(topic, &format!("p{}", i % 4), json!({ "n": i }))
        })
        .collect();

    let mut logs = Vec::new();
    for mode in [AuditMode::Immediate, AuditMode::Batch] {
        let mut config = WardenConfig::default();
        config.audit.mode = Some(mode);
        let store = Arc::new(MemoryStore::new());
        let log = AuditLog::new(store.clone(), &config);
        for event in &events {
            log.record_event(event).await;
        }
        log.flush().await;
        logs.push((store, log));
    }

    let project = |log: Vec<warden_plugins::audit::AuditEntry>| {
        log.into_iter()
            .map(|e| (e.timestamp, e.category, e.event, e.plugin_id, e.severity, e.details))
            .collect::<Vec<_>>()
    };
    let immediate = project(logs[0].1.export().await);
    let batch = project(logs[1].1.export().await);
    assert_eq!(immediate.len(), 25);
    assert_eq!(immediate, batch);

    let persisted_immediate = logs[0].0.get(warden_core::storage::AUDIT_LOG_KEY).await.unwrap();
    let persisted_batch = logs[1].0.get(warden_core::storage::AUDIT_LOG_KEY).await.unwrap();
    assert_eq!(
        persisted_immediate.map(|v| v.as_array().map(Vec::len)),
        persisted_batch.map(|v| v.as_array().map(Vec::len))
    );
}

#[tokio::test]
async fn test_list_plugins_annotations() {
    let manager = start(
        config_at(SecurityLevel::Normal),
        Arc::new(MemoryStore::new()),
        vec![
            Plugin::declarative(manifest("net").with_permissions(&["network"])),
            Plugin::declarative(warden_plugins::PluginManifest::new("old", "1.0.0")),
        ],
    )
    .await;
    manager.activate_plugin("net").await;
    manager.approve_permission("net", "network").await.unwrap();

    let listed = manager.list_plugins().await;
    let net = listed.iter().find(|p| p.id == "net").unwrap();
    assert!(net.active);
    assert_eq!(net.security_score, 85);
    assert!(net.permissions.approved.contains("network"));

    let old = listed.iter().find(|p| p.id == "old").unwrap();
    assert_eq!(old.compatible, Some(false));
    assert!(old.compatibility_reason.is_some());
}
