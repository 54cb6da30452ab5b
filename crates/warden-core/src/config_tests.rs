//! Config module tests

use crate::config::WardenConfig;
use crate::policy::{AuditMode, SecurityLevel};

#[test]
fn test_config_default() {
    let config = WardenConfig::default();

    assert_eq!(config.security.level, SecurityLevel::Normal);
    assert!(config.security.checks.static_analysis);
    assert!(config.security.fail_closed_unmapped);
    assert!(config.audit.mode.is_none());
    assert_eq!(config.audit.batch_interval_ms, 5_000);
    assert_eq!(config.resources.reset_interval_secs, 60);
    assert_eq!(config.resources.restriction_factor, 0.5);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_set_and_get() {
    let mut config = WardenConfig::default();

    config.set("security.level", "high").unwrap();
    assert_eq!(config.get("security.level").unwrap(), "high");

    config.set("audit.mode", "immediate").unwrap();
    assert_eq!(config.audit.mode, Some(AuditMode::Immediate));

    config.set("audit.mode", "auto").unwrap();
    assert!(config.audit.mode.is_none());

    config.set("security.checks.static_analysis", "off").unwrap();
    assert_eq!(config.get("security.checks.static_analysis").unwrap(), "false");
}

#[test]
fn test_config_rejects_invalid_values() {
    let mut config = WardenConfig::default();

    assert!(config.set("security.level", "paranoid").is_err());
    assert!(config.set("resources.restriction_factor", "1.5").is_err());
    assert!(config.set("resources.reset_interval_secs", "0").is_err());
    assert!(config.set("host.app_version", "not-a-version").is_err());
    assert!(config.set("no.such.key", "1").is_err());
    assert!(config.get("no.such.key").is_err());
}

#[test]
fn test_config_list_covers_checks() {
    let config = WardenConfig::default();
    let entries = config.list().unwrap();

    assert!(entries.iter().any(|(k, _)| k == "security.checks.resource_monitoring"));
    assert!(entries.iter().any(|(k, _)| k == "audit.capacity"));
}

#[test]
fn test_config_from_partial_toml() {
    let config = WardenConfig::from_toml(
        r#"
        [host]
        app_version = "2.3.0"

        [security]
        level = "low"
        "#,
    )
    .unwrap();

    assert_eq!(config.host.app_version, "2.3.0");
    assert_eq!(config.security.level, SecurityLevel::Low);
    assert_eq!(config.resources.history_len, 60);
}

#[test]
fn test_config_toml_roundtrip() {
    let mut config = WardenConfig::default();
    config.set("audit.capacity", "42").unwrap();

    let text = toml::to_string_pretty(&config).unwrap();
    let parsed = WardenConfig::from_toml(&text).unwrap();
    assert_eq!(parsed.audit.capacity, Some(42));
}
