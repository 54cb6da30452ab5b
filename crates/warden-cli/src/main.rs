//! Warden CLI - plugin governance for host applications

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, warn};
use warden_core::config::WardenConfig;
use warden_core::policy::{ActiveChecks, AuditMode, SecurityLevel};
use warden_core::storage::{KeyValueStore, SqliteStore};
use warden_plugins::PluginManager;
use warden_plugins::audit::{AuditCategory, AuditFilter};
use warden_plugins::loader::ManifestDirSource;
use warden_plugins::permissions::CATALOG;

#[cfg(test)]
mod main_tests;

#[derive(Parser)]
#[command(name = "warden")]
#[command(author, version, about = "Plugin governance for host applications", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, clap::ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered plugins
    List,

    /// Activate a plugin and its dependencies
    Activate { id: String },

    /// Deactivate a plugin
    Deactivate {
        id: String,
        /// Deactivate even when active plugins depend on it
        #[arg(long)]
        force: bool,
    },

    /// Rediscover plugins and restore the active set
    Reload,

    /// Manage plugin permissions
    Permissions {
        #[command(subcommand)]
        action: PermissionAction,
    },

    /// Show or change the security level
    Level {
        /// New level (low, normal, high)
        level: Option<String>,
    },

    /// Toggle a named security check
    Check { name: String, state: Switch },

    /// Blacklist a plugin
    Blacklist {
        id: String,
        #[arg(short, long, default_value = "blacklisted by operator")]
        reason: String,
    },

    /// Remove a plugin from the blacklist
    Whitelist { id: String },

    /// Query the audit trail
    Audit {
        #[arg(short, long)]
        plugin: Option<String>,
        #[arg(short, long)]
        category: Option<String>,
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Set the audit mode (immediate or batch)
    AuditMode { mode: String },

    /// Clear the audit trail
    AuditClear,

    /// Show security statistics
    Stats,

    /// Show the resolved load order
    Order,

    /// Validate plugins against dependencies, conflicts and cycles
    Validate { id: Option<String> },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum PermissionAction {
    /// Approve a pending permission
    Approve { plugin: String, permission: String },
    /// Reject a pending permission
    Reject { plugin: String, permission: String },
    /// Revoke an approved permission
    Revoke { plugin: String, permission: String },
    /// List pending permission requests
    Pending { plugin: Option<String> },
    /// List known permissions and their risk
    Catalog,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    fn json<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Confirmation line, suppressed by `--quiet`
    fn note(&self, message: impl AsRef<str>) {
        if !self.quiet && !self.is_json() {
            println!("{}", message.as_ref());
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_directive = if cli.quiet { "warden=warn" } else { "warden=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn report_error(error: &anyhow::Error) {
    match error.downcast_ref::<warden_core::Error>() {
        Some(e) => {
            eprintln!("Error [{}]: {}", e.code(), e);
            if let Some(suggestion) = e.suggestion() {
                eprintln!("  Try: {}", suggestion);
            }
        }
        None => eprintln!("Error: {:#}", error),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let out = Output {
        format: cli.format,
        quiet: cli.quiet,
    };

    let command = match cli.command {
        Commands::Config { action } => return cmd_config(action, &out),
        command => command,
    };

    let config = WardenConfig::load()?;
    let session = Session::open(config).await?;
    let result = dispatch(command, &session, &out).await;
    session.close().await;
    result
}

/// A manager initialized over the on-disk store for one invocation
struct Session {
    manager: PluginManager,
    store: Arc<SqliteStore>,
    config: WardenConfig,
}

impl Session {
    async fn open(config: WardenConfig) -> anyhow::Result<Self> {
        let db_path = config.database_path()?;
        debug!(path = %db_path.display(), "Opening state database");
        let store = Arc::new(SqliteStore::open(&db_path).await?);

        let manager = PluginManager::builder(config.clone())
            .store(Arc::clone(&store) as Arc<dyn KeyValueStore>)
            .source(ManifestDirSource::new(config.plugins.dir.clone()))
            .build()
            .await?;
        manager.initialize().await?;

        Ok(Self {
            manager,
            store,
            config,
        })
    }

    async fn close(self) {
        if !self.manager.shutdown().await {
            warn!("Plugin states were not persisted");
        }
        self.store.close().await;
    }
}

async fn dispatch(command: Commands, session: &Session, out: &Output) -> anyhow::Result<()> {
    let manager = &session.manager;
    match command {
        Commands::List => cmd_list(manager, out).await,

        Commands::Activate { id } => {
            manager.try_activate_plugin(&id).await?;
            out.note(format!("Plugin '{}' activated.", id));
            Ok(())
        }

        Commands::Deactivate { id, force } => {
            let clean = manager.try_deactivate_plugin(&id, force).await?;
            if clean {
                out.note(format!("Plugin '{}' deactivated.", id));
            } else {
                out.note(format!(
                    "Plugin '{}' deactivated, but its teardown reported an error.",
                    id
                ));
            }
            Ok(())
        }

        Commands::Reload => {
            let summary = manager.reload().await?;
            if out.is_json() {
                return out.json(&summary);
            }
            out.note(format!("Restored: {}", summary.restored.join(", ")));
            if !summary.lost.is_empty() {
                println!("Could not restore: {}", summary.lost.join(", "));
            }
            Ok(())
        }

        Commands::Permissions { action } => cmd_permissions(manager, action, out).await,

        Commands::Level { level } => match level {
            None => {
                let current = manager.security().security_level().await;
                if out.is_json() {
                    out.json(&current)
                } else {
                    println!("{}", current);
                    Ok(())
                }
            }
            Some(level) => {
                let level: SecurityLevel = level.parse()?;
                if !manager.set_security_level(level).await {
                    warn!("Security level applied but not persisted");
                }
                out.note(format!("Security level set to {}.", level));
                Ok(())
            }
        },

        Commands::Check { name, state } => {
            let enabled = state == Switch::On;
            manager.toggle_check(&name, enabled).await?;
            out.note(format!(
                "Check '{}' {}.",
                name,
                if enabled { "enabled" } else { "disabled" }
            ));
            Ok(())
        }

        Commands::Blacklist { id, reason } => {
            if manager.blacklist_plugin(&id, &reason).await {
                out.note(format!("Plugin '{}' blacklisted.", id));
            } else {
                out.note(format!("Plugin '{}' was already blacklisted.", id));
            }
            Ok(())
        }

        Commands::Whitelist { id } => {
            if manager.whitelist_plugin(&id).await {
                out.note(format!("Plugin '{}' removed from the blacklist.", id));
            } else {
                out.note(format!("Plugin '{}' was not blacklisted.", id));
            }
            Ok(())
        }

        Commands::Audit {
            plugin,
            category,
            limit,
        } => {
            let category = category
                .map(|c| c.parse::<AuditCategory>())
                .transpose()?;
            let filter = AuditFilter {
                plugin_id: plugin,
                category,
                limit,
                ..Default::default()
            };
            cmd_audit(manager, &filter, out).await
        }

        Commands::AuditMode { mode } => {
            let mode: AuditMode = mode.parse()?;
            manager.set_audit_mode(mode).await;

            let mut config = session.config.clone();
            config.audit.mode = Some(mode);
            config.save()?;
            out.note(format!("Audit mode set to {}.", mode));
            Ok(())
        }

        Commands::AuditClear => {
            manager.clear_audit_log().await;
            out.note("Audit trail cleared.");
            Ok(())
        }

        Commands::Stats => cmd_stats(manager, out).await,

        Commands::Order => {
            let order = manager.load_order().await;
            if out.is_json() {
                return out.json(&order);
            }
            for (position, id) in order.order.iter().enumerate() {
                println!("{:>3}. {}", position + 1, id);
            }
            for warning in &order.warnings {
                println!("warning: {}", warning);
            }
            Ok(())
        }

        Commands::Validate { id } => cmd_validate(manager, id.as_deref(), out).await,

        Commands::Config { action } => cmd_config(action, out),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_list(manager: &PluginManager, out: &Output) -> anyhow::Result<()> {
    let plugins = manager.list_plugins().await;
    if out.is_json() {
        return out.json(&plugins);
    }

    if plugins.is_empty() {
        out.note("No plugins registered.");
        return Ok(());
    }

    for p in plugins {
        let mut flags = Vec::new();
        if p.active {
            flags.push("active".to_string());
        }
        if p.blacklisted {
            flags.push("blacklisted".to_string());
        }
        if p.restricted {
            flags.push("restricted".to_string());
        }
        if p.compatible == Some(false) {
            flags.push(format!(
                "incompatible: {}",
                p.compatibility_reason.as_deref().unwrap_or("unknown")
            ));
        }
        if !p.permissions.pending.is_empty() {
            let pending: Vec<&str> = p.permissions.pending.iter().map(String::as_str).collect();
            flags.push(format!("pending: {}", pending.join(",")));
        }

        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join("; "))
        };
        println!(
            "  {} {} (priority {}, score {}){}",
            p.id, p.version, p.priority, p.security_score, flags
        );
        if let Some(error) = &p.last_error {
            println!("      last error: {}", error);
        }
    }
    Ok(())
}

async fn cmd_permissions(
    manager: &PluginManager,
    action: PermissionAction,
    out: &Output,
) -> anyhow::Result<()> {
    match action {
        PermissionAction::Approve { plugin, permission } => {
            manager.approve_permission(&plugin, &permission).await?;
            out.note(format!("Approved '{}' for '{}'.", permission, plugin));
        }
        PermissionAction::Reject { plugin, permission } => {
            manager.reject_permission(&plugin, &permission).await?;
            out.note(format!("Rejected '{}' for '{}'.", permission, plugin));
        }
        PermissionAction::Revoke { plugin, permission } => {
            manager.revoke_permission(&plugin, &permission).await?;
            out.note(format!("Revoked '{}' from '{}'.", permission, plugin));
        }
        PermissionAction::Pending { plugin } => {
            let requests: Vec<_> = manager
                .pending_permission_requests()
                .await
                .into_iter()
                .filter(|r| plugin.as_deref().is_none_or(|p| p == r.plugin_id))
                .collect();
            if out.is_json() {
                return out.json(&requests);
            }
            if requests.is_empty() {
                out.note("No pending permission requests.");
            }
            for r in requests {
                println!(
                    "  {} wants '{}' (risk {}, requested {})",
                    r.plugin_id,
                    r.permission,
                    r.risk,
                    r.requested_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        PermissionAction::Catalog => {
            if out.is_json() {
                return out.json(&CATALOG);
            }
            for spec in CATALOG {
                println!("  {:<16} {:<8} {}", spec.name, spec.risk.as_str(), spec.description);
            }
        }
    }
    Ok(())
}

async fn cmd_audit(manager: &PluginManager, filter: &AuditFilter, out: &Output) -> anyhow::Result<()> {
    let entries = manager.audit_log(filter).await;
    if out.is_json() {
        return out.json(&entries);
    }
    if entries.is_empty() {
        out.note("No audit entries.");
    }
    for entry in entries {
        println!(
            "{} {:<8} {:<20} {:<24} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.severity.to_string(),
            entry.category.to_string(),
            entry.event,
            entry.plugin_id.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn cmd_stats(manager: &PluginManager, out: &Output) -> anyhow::Result<()> {
    let stats = manager.security_stats().await;
    if out.is_json() {
        return out.json(&stats);
    }

    println!("Security level: {}", stats.level);
    for name in ActiveChecks::NAMES {
        let enabled = stats.checks.get(name).unwrap_or(false);
        println!("  {:<24} {}", name, if enabled { "on" } else { "off" });
    }
    println!("Blacklisted plugins: {}", stats.blacklisted);
    println!("Security events: {}", stats.total_events);
    for (severity, count) in &stats.events_by_severity {
        println!("  {:<8} {}", severity.to_string(), count);
    }
    if !stats.restricted.is_empty() {
        println!("Restricted: {}", stats.restricted.join(", "));
    }
    if !stats.monitored.is_empty() {
        println!("Monitored: {}", stats.monitored.join(", "));
    }
    Ok(())
}

async fn cmd_validate(manager: &PluginManager, id: Option<&str>, out: &Output) -> anyhow::Result<()> {
    let validations: Vec<_> = manager
        .validate_all_plugins()
        .await
        .into_iter()
        .filter(|v| id.is_none_or(|id| id == v.plugin_id))
        .collect();

    if let Some(id) = id {
        if validations.is_empty() {
            return Err(warden_core::Error::PluginNotFound(id.to_string()).into());
        }
    }

    if out.is_json() {
        return out.json(&validations);
    }

    for v in &validations {
        let verdict = if v.valid { "ok" } else { "invalid" };
        println!("  {} {} (priority {})", v.plugin_id, verdict, v.priority);
        for issue in &v.issues {
            println!("      - {}", issue);
        }
    }

    if let Some(id) = id {
        let result = manager.compatibility_of(id).await?;
        if let Some(reason) = result.reason {
            println!("  compatibility: {}", reason);
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, out: &Output) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = WardenConfig::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = WardenConfig::load()?;
            config.set(&key, &value)?;
            config.save()?;
            out.note(format!("Set {} = {}", key, value));
        }
        ConfigAction::List => {
            let config = WardenConfig::load()?;
            let items = config.list()?;
            for (key, value) in items {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            WardenConfig::reset()?;
            out.note("Configuration reset to defaults.");
        }
        ConfigAction::Path => {
            let path = WardenConfig::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
