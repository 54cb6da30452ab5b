//! CLI tests

use crate::{Cli, Commands, ConfigAction, OutputFormat, PermissionAction, Switch};
use clap::{CommandFactory, Parser};

#[test]
fn test_cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn test_deactivate_force_flag() {
    let cli = Cli::try_parse_from(["warden", "deactivate", "editor", "--force"]).unwrap();
    match cli.command {
        Commands::Deactivate { id, force } => {
            assert_eq!(id, "editor");
            assert!(force);
        }
        _ => panic!("expected deactivate"),
    }
}

#[test]
fn test_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from(["warden", "list", "--format", "json", "-q"]).unwrap();
    assert_eq!(cli.format, OutputFormat::Json);
    assert!(cli.quiet);
    assert!(matches!(cli.command, Commands::List));
}

#[test]
fn test_permissions_pending_plugin_is_optional() {
    let all = Cli::try_parse_from(["warden", "permissions", "pending"]).unwrap();
    assert!(matches!(
        all.command,
        Commands::Permissions {
            action: PermissionAction::Pending { plugin: None }
        }
    ));

    let one = Cli::try_parse_from(["warden", "permissions", "approve", "clock", "storage"]).unwrap();
    match one.command {
        Commands::Permissions {
            action: PermissionAction::Approve { plugin, permission },
        } => {
            assert_eq!(plugin, "clock");
            assert_eq!(permission, "storage");
        }
        _ => panic!("expected permissions approve"),
    }
}

#[test]
fn test_check_requires_on_or_off() {
    let cli = Cli::try_parse_from(["warden", "check", "static_analysis", "off"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Check { state: Switch::Off, .. }
    ));
    assert!(Cli::try_parse_from(["warden", "check", "static_analysis", "maybe"]).is_err());
}

#[test]
fn test_kebab_case_subcommands() {
    assert!(matches!(
        Cli::try_parse_from(["warden", "audit-mode", "batch"]).unwrap().command,
        Commands::AuditMode { .. }
    ));
    assert!(matches!(
        Cli::try_parse_from(["warden", "audit-clear"]).unwrap().command,
        Commands::AuditClear
    ));
}

#[test]
fn test_config_subcommands() {
    let cli = Cli::try_parse_from(["warden", "config", "set", "security.level", "high"]).unwrap();
    match cli.command {
        Commands::Config {
            action: ConfigAction::Set { key, value },
        } => {
            assert_eq!(key, "security.level");
            assert_eq!(value, "high");
        }
        _ => panic!("expected config set"),
    }
}

#[test]
fn test_unknown_format_rejected() {
    assert!(Cli::try_parse_from(["warden", "list", "--format", "yaml"]).is_err());
}
