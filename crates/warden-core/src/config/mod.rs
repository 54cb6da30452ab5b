//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::policy::{ActiveChecks, AuditMode, SecurityLevel};

/// Warden configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WardenConfig {
    pub host: HostConfig,
    pub security: SecurityConfig,
    pub audit: AuditConfig,
    pub resources: ResourceConfig,
    pub storage: StorageConfig,
    pub plugins: PluginsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Host application version plugins are checked against
    pub app_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub level: SecurityLevel,
    /// Deny host methods that no permission maps to when running at `high`
    pub fail_closed_unmapped: bool,
    pub checks: ActiveChecks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Explicit mode; derived from the security level when unset
    pub mode: Option<AuditMode>,
    pub batch_interval_ms: u64,
    /// Explicit capacity; derived from the security level when unset
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub reset_interval_secs: u64,
    pub history_len: usize,
    /// Quota multiplier applied to restricted plugins (0 < factor < 1)
    pub restriction_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path; defaults to the config directory
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PluginsConfig {
    /// Manifest directory; defaults to `~/.warden/plugins`
    pub dir: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            level: SecurityLevel::Normal,
            fail_closed_unmapped: true,
            checks: ActiveChecks::default(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            mode: None,
            batch_interval_ms: 5_000,
            capacity: None,
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            reset_interval_secs: 60,
            history_len: 60,
            restriction_factor: 0.5,
        }
    }
}

impl WardenConfig {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("WARDEN_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("warden")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Resolved SQLite database path
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        match &self.storage.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("warden.db")),
        }
    }

    /// Load configuration from file, or return defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(WardenConfig::default())
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let config: WardenConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        semver::Version::parse(&self.host.app_version).map_err(|e| {
            anyhow!("host.app_version '{}' is not a semantic version: {}", self.host.app_version, e)
        })?;

        let factor = self.resources.restriction_factor;
        if !(factor > 0.0 && factor < 1.0) {
            return Err(anyhow!("resources.restriction_factor must be between 0 and 1 (exclusive)"));
        }
        if self.resources.reset_interval_secs == 0 {
            return Err(anyhow!("resources.reset_interval_secs must be greater than zero"));
        }
        if self.audit.batch_interval_ms == 0 {
            return Err(anyhow!("audit.batch_interval_ms must be greater than zero"));
        }
        if self.audit.capacity == Some(0) {
            return Err(anyhow!("audit.capacity must be greater than zero"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "host.app_version" => Ok(self.host.app_version.clone()),

            "security.level" => Ok(self.security.level.to_string()),
            "security.fail_closed_unmapped" => Ok(self.security.fail_closed_unmapped.to_string()),
            k if k.starts_with("security.checks.") => {
                let name = &k["security.checks.".len()..];
                self.security
                    .checks
                    .get(name)
                    .map(|v| v.to_string())
                    .ok_or_else(|| anyhow!("Unknown security check: {}", name))
            }

            "audit.mode" => Ok(self
                .audit
                .mode
                .map(|m| m.to_string())
                .unwrap_or_else(|| "(derived from security level)".to_string())),
            "audit.batch_interval_ms" => Ok(self.audit.batch_interval_ms.to_string()),
            "audit.capacity" => Ok(self
                .audit
                .capacity
                .map(|c| c.to_string())
                .unwrap_or_else(|| "(derived from security level)".to_string())),

            "resources.reset_interval_secs" => Ok(self.resources.reset_interval_secs.to_string()),
            "resources.history_len" => Ok(self.resources.history_len.to_string()),
            "resources.restriction_factor" => Ok(self.resources.restriction_factor.to_string()),

            "storage.database_path" => Ok(self.database_path()?.display().to_string()),
            "plugins.dir" => Ok(self
                .plugins
                .dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(default: ~/.warden/plugins)".to_string())),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `warden config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "host.app_version" => {
                semver::Version::parse(value)
                    .with_context(|| format!("Invalid app version: {}", value))?;
                self.host.app_version = value.to_string();
            }

            "security.level" => {
                self.security.level = value.parse()?;
            }
            "security.fail_closed_unmapped" => {
                self.security.fail_closed_unmapped = parse_bool(value)?;
            }
            k if k.starts_with("security.checks.") => {
                let name = &k["security.checks.".len()..];
                self.security.checks.set(name, parse_bool(value)?)?;
            }

            "audit.mode" => {
                self.audit.mode = match value {
                    "" | "auto" => None,
                    other => Some(other.parse()?),
                };
            }
            "audit.batch_interval_ms" => {
                let interval: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid batch_interval_ms value: {}", value))?;
                if interval == 0 {
                    return Err(anyhow!("Batch interval must be greater than zero"));
                }
                self.audit.batch_interval_ms = interval;
            }
            "audit.capacity" => {
                self.audit.capacity = match value {
                    "" | "auto" => None,
                    other => {
                        let capacity: usize = other
                            .parse()
                            .with_context(|| format!("Invalid capacity value: {}", other))?;
                        if capacity == 0 {
                            return Err(anyhow!("Audit capacity must be greater than zero"));
                        }
                        Some(capacity)
                    }
                };
            }

            "resources.reset_interval_secs" => {
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid reset_interval_secs value: {}", value))?;
                if secs == 0 {
                    return Err(anyhow!("Reset interval must be greater than zero"));
                }
                self.resources.reset_interval_secs = secs;
            }
            "resources.history_len" => {
                self.resources.history_len = value
                    .parse()
                    .with_context(|| format!("Invalid history_len value: {}", value))?;
            }
            "resources.restriction_factor" => {
                let factor: f64 = value
                    .parse()
                    .with_context(|| format!("Invalid restriction_factor value: {}", value))?;
                if !(factor > 0.0 && factor < 1.0) {
                    return Err(anyhow!("Restriction factor must be between 0 and 1 (exclusive)"));
                }
                self.resources.restriction_factor = factor;
            }

            "storage.database_path" => {
                self.storage.database_path = Some(PathBuf::from(value));
            }
            "plugins.dir" => {
                self.plugins.dir = Some(PathBuf::from(value));
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `warden config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let mut keys = vec![
            "host.app_version".to_string(),
            "security.level".to_string(),
            "security.fail_closed_unmapped".to_string(),
        ];
        keys.extend(
            ActiveChecks::NAMES
                .iter()
                .map(|name| format!("security.checks.{}", name)),
        );
        keys.extend(
            [
                "audit.mode",
                "audit.batch_interval_ms",
                "audit.capacity",
                "resources.reset_interval_secs",
                "resources.history_len",
                "resources.restriction_factor",
                "storage.database_path",
                "plugins.dir",
            ]
            .iter()
            .map(|k| k.to_string()),
        );

        keys.into_iter()
            .map(|key| {
                let value = self.get(&key)?;
                Ok((key, value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "on" | "1" | "yes" => Ok(true),
        "false" | "off" | "0" | "no" => Ok(false),
        other => Err(anyhow!("Invalid boolean value: {}", other)),
    }
}
