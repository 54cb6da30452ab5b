//! Error module tests

use crate::error::{Error, Result};

#[test]
fn test_plugin_not_found_error() {
    let error = Error::PluginNotFound("clock".to_string());
    assert_eq!(error.code(), "E001");
    assert_eq!(error.suggestion(), Some("warden list".to_string()));
    assert!(error.to_string().contains("clock"));
}

#[test]
fn test_blacklisted_error_points_at_whitelist() {
    let error = Error::Blacklisted("evil".to_string());
    assert_eq!(error.code(), "E200");
    assert_eq!(error.suggestion(), Some("warden whitelist evil".to_string()));
}

#[test]
fn test_dependents_active_error() {
    let error = Error::DependentsActive("lib".to_string(), "app, tool".to_string());
    assert_eq!(error.code(), "E102");
    assert!(error.to_string().contains("app, tool"));
    assert_eq!(
        error.suggestion(),
        Some("warden deactivate lib --force".to_string())
    );
}

#[test]
fn test_permission_denied_error() {
    let error = Error::PermissionDenied {
        plugin: "p".to_string(),
        reason: "missing 'network'".to_string(),
    };
    assert_eq!(error.code(), "E202");
    assert!(error.to_string().contains("missing 'network'"));
}

#[test]
fn test_plugin_fault_classification() {
    assert!(Error::PluginFailed("p".to_string(), "boom".to_string()).is_plugin_fault());
    assert!(Error::Timeout("p".to_string(), 2_000).is_plugin_fault());
    assert!(!Error::Blacklisted("p".to_string()).is_plugin_fault());
    assert!(!Error::NotInitialized.is_plugin_fault());
}

#[test]
fn test_timeout_message_carries_duration() {
    let error = Error::Timeout("slow".to_string(), 5_000);
    assert_eq!(error.code(), "E301");
    assert!(error.to_string().contains("5000 ms"));
}

#[test]
fn test_serialization_error_conversion() {
    let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope");
    let error: Error = parse.unwrap_err().into();
    assert_eq!(error.code(), "E402");
    assert!(error.suggestion().is_none());
}

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let error: Error = io.into();
    assert_eq!(error.code(), "E9999");
}

#[test]
fn test_result_alias_propagates() {
    fn inner() -> Result<u32> {
        Err(Error::InvalidInput("bad".to_string()))
    }
    fn outer() -> Result<u32> {
        let value = inner()?;
        Ok(value + 1)
    }
    assert!(matches!(outer(), Err(Error::InvalidInput(_))));
}
