//! CLI integration tests for warden
//!
//! Drives the warden binary end-to-end with assert_cmd. Every test gets its
//! own config directory (and therefore its own state database) and plugin
//! directory, so state carries across invocations within a test only.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::path::PathBuf;
use tempfile::TempDir;

struct Env {
    _root: TempDir,
    config_dir: PathBuf,
    plugin_dir: PathBuf,
}

impl Env {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let config_dir = root.path().join("config");
        let plugin_dir = root.path().join("plugins");
        std::fs::create_dir_all(&plugin_dir).unwrap();
        Self {
            _root: root,
            config_dir,
            plugin_dir,
        }
    }

    /// Helper to create a command isolated to this environment
    #[allow(deprecated)]
    fn warden(&self) -> Command {
        let mut cmd = Command::cargo_bin("warden").unwrap();
        cmd.env("WARDEN_CONFIG_DIR", &self.config_dir);
        cmd.env("WARDEN_PLUGIN_DIR", &self.plugin_dir);
        cmd.env("RUST_LOG", "warden=error");
        cmd
    }

    fn manifest(&self, id: &str, extra: Value) {
        let mut manifest = json!({
            "id": id,
            "name": id,
            "version": "1.0.0",
            "author": "tests",
        });
        if let (Some(base), Some(extra)) = (manifest.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        std::fs::write(
            self.plugin_dir.join(format!("{}.json", id)),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();
    }

    fn json(&self, args: &[&str]) -> Value {
        let output = self
            .warden()
            .args(args)
            .args(["--format", "json"])
            .output()
            .unwrap();
        assert!(output.status.success(), "{:?} failed: {:?}", args, output);
        serde_json::from_slice(&output.stdout).unwrap()
    }

    fn active(&self) -> Vec<String> {
        self.json(&["list"])
            .as_array()
            .unwrap()
            .iter()
            .filter(|p| p["active"] == true)
            .map(|p| p["id"].as_str().unwrap().to_string())
            .collect()
    }
}

#[test]
fn test_help_command() {
    let env = Env::new();
    env.warden()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("activate"))
        .stdout(predicate::str::contains("permissions"))
        .stdout(predicate::str::contains("audit"));
}

#[test]
fn test_version_output() {
    let env = Env::new();
    env.warden()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("warden"));
}

#[test]
fn test_list_with_no_plugins() {
    let env = Env::new();
    env.warden()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No plugins registered."));
}

#[test]
fn test_list_discovers_manifests_and_skips_broken_ones() {
    let env = Env::new();
    env.manifest("clock", json!({ "permissions": ["ui"] }));
    std::fs::write(env.plugin_dir.join("broken.json"), "{ not json").unwrap();

    let listed = env.json(&["list"]);
    let ids: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["clock"]);
    assert_eq!(listed[0]["active"], false);
}

#[test]
fn test_activation_pulls_dependencies_and_persists() {
    let env = Env::new();
    env.manifest("storage-kit", json!({}));
    env.manifest("editor", json!({ "dependencies": [{ "id": "storage-kit" }] }));

    env.warden()
        .args(["activate", "editor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Plugin 'editor' activated."));

    let mut active = env.active();
    active.sort();
    assert_eq!(active, vec!["editor", "storage-kit"]);
}

#[test]
fn test_unknown_plugin_reports_code_and_suggestion() {
    let env = Env::new();
    env.warden()
        .args(["activate", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E001"))
        .stderr(predicate::str::contains("warden list"));
}

#[test]
fn test_deactivate_with_dependents_needs_force() {
    let env = Env::new();
    env.manifest("base", json!({}));
    env.manifest("app", json!({ "dependencies": [{ "id": "base" }] }));
    env.warden().args(["activate", "app"]).assert().success();

    env.warden()
        .args(["deactivate", "base"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E102"))
        .stderr(predicate::str::contains("warden deactivate base --force"));

    env.warden()
        .args(["deactivate", "base", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Plugin 'base' deactivated."));
}

#[test]
fn test_order_places_dependencies_first() {
    let env = Env::new();
    env.manifest("a", json!({ "dependencies": [{ "id": "b" }] }));
    env.manifest("b", json!({ "dependencies": [{ "id": "c" }] }));
    env.manifest("c", json!({}));

    let order = env.json(&["order"]);
    assert_eq!(order["order"], json!(["c", "b", "a"]));
    assert_eq!(order["warnings"], json!([]));
}

#[test]
fn test_validate_flags_cycles() {
    let env = Env::new();
    env.manifest("x", json!({ "dependencies": [{ "id": "y" }] }));
    env.manifest("y", json!({ "dependencies": [{ "id": "x" }] }));

    let validations = env.json(&["validate"]);
    for v in validations.as_array().unwrap() {
        assert_eq!(v["in_cycle"], true);
        assert_eq!(v["valid"], false);
    }

    env.warden()
        .args(["validate", "nobody"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E001"));
}

#[test]
fn test_high_level_leaves_permissions_pending_until_approved() {
    let env = Env::new();
    env.manifest("notes", json!({ "permissions": ["ui", "storage"] }));

    env.warden()
        .args(["config", "set", "security.level", "high"])
        .assert()
        .success();
    env.warden()
        .arg("level")
        .assert()
        .success()
        .stdout(predicate::str::contains("high"));

    env.warden().args(["activate", "notes"]).assert().success();

    let pending = env.json(&["permissions", "pending", "notes"]);
    let names: Vec<&str> = pending
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["permission"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["storage"]);

    env.warden()
        .args(["permissions", "approve", "notes", "storage"])
        .assert()
        .success();
    assert_eq!(env.json(&["permissions", "pending"]), json!([]));
}

#[test]
fn test_blacklist_blocks_activation_until_whitelisted() {
    let env = Env::new();
    env.manifest("shady", json!({}));

    env.warden()
        .args(["blacklist", "shady", "--reason", "phones home"])
        .assert()
        .success();
    env.warden()
        .args(["activate", "shady"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E200"))
        .stderr(predicate::str::contains("warden whitelist shady"));

    env.warden().args(["whitelist", "shady"]).assert().success();
    env.warden().args(["activate", "shady"]).assert().success();
}

#[test]
fn test_dangerous_code_is_refused() {
    let env = Env::new();
    env.manifest("evil", json!({ "code": "eval(payload)" }));

    env.warden()
        .args(["activate", "evil"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E2"));
    assert!(env.active().is_empty());
}

#[test]
fn test_audit_trail_survives_invocations_and_clears() {
    let env = Env::new();
    env.manifest("clock", json!({}));
    env.warden().args(["activate", "clock"]).assert().success();
    env.warden().args(["deactivate", "clock"]).assert().success();

    let entries = env.json(&["audit", "--plugin", "clock"]);
    assert!(
        entries
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e["event"] == "plugin.activated")
    );

    env.warden()
        .args(["audit", "--category", "nonsense"])
        .assert()
        .failure();

    env.warden().arg("audit-clear").assert().success();
    let after = env.json(&["audit", "--plugin", "clock"]);
    assert!(
        after
            .as_array()
            .unwrap()
            .iter()
            .all(|e| e["event"] != "plugin.activated")
    );
}

#[test]
fn test_check_toggle_shows_in_stats() {
    let env = Env::new();
    env.warden()
        .args(["check", "static_analysis", "off"])
        .assert()
        .success();

    let stats = env.json(&["stats"]);
    assert_eq!(stats["checks"]["static_analysis"], false);
    assert_eq!(stats["checks"]["compatibility"], true);

    env.warden()
        .args(["check", "telepathy", "on"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown security check"));
}

#[test]
fn test_permission_catalog() {
    let env = Env::new();
    let catalog = env.json(&["permissions", "catalog"]);
    let names: Vec<&str> = catalog
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"storage"));
    assert!(names.contains(&"code_execution"));
}

#[test]
fn test_config_round_trip() {
    let env = Env::new();
    env.warden()
        .args(["config", "set", "audit.mode", "immediate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set audit.mode = immediate"));
    env.warden()
        .args(["config", "get", "audit.mode"])
        .assert()
        .success()
        .stdout(predicate::str::contains("immediate"));
    env.warden()
        .args(["config", "set", "security.level", "paranoid"])
        .assert()
        .failure();
    env.warden()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_quiet_mode_suppresses_confirmations() {
    let env = Env::new();
    env.manifest("clock", json!({}));
    env.warden()
        .args(["activate", "clock", "--quiet"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}
