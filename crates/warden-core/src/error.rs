//! Error types for Warden

use thiserror::Error;

/// Result type alias using Warden's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Warden error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Structural errors (E001-E099)
    #[error("Plugin '{0}' not found. Run `warden list` to see registered plugins.")]
    PluginNotFound(String),

    #[error("Invalid plugin descriptor: {0}")]
    InvalidDescriptor(String),

    // Compatibility errors (E100-E199)
    #[error("Plugin '{0}' is incompatible: {1}")]
    Incompatible(String, String),

    #[error("Dependency '{dependency}' of plugin '{plugin}' could not be activated")]
    DependencyFailed { plugin: String, dependency: String },

    #[error("Plugin '{0}' is required by active plugins: {1}. Use --force to deactivate anyway.")]
    DependentsActive(String, String),

    // Security errors (E200-E299)
    #[error("Plugin '{0}' is blacklisted. Run `warden whitelist {0}` to allow it again.")]
    Blacklisted(String),

    #[error("Security validation failed for plugin '{0}': {1}")]
    SecurityValidationFailed(String, String),

    #[error("Permission denied for plugin '{plugin}': {reason}")]
    PermissionDenied { plugin: String, reason: String },

    #[error("Unknown permission '{0}'")]
    UnknownPermission(String),

    // Runtime errors (E300-E399)
    #[error("Plugin '{0}' failed: {1}")]
    PluginFailed(String, String),

    #[error("Plugin '{0}' timed out after {1} ms")]
    Timeout(String, u64),

    #[error("Host API method '{0}' is not available")]
    MethodNotFound(String),

    // Storage errors (E400-E499)
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Plugin manager is not initialized")]
    NotInitialized,

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::PluginNotFound(_) => "E001",
            Self::InvalidDescriptor(_) => "E002",
            Self::Incompatible(..) => "E100",
            Self::DependencyFailed { .. } => "E101",
            Self::DependentsActive(..) => "E102",
            Self::Blacklisted(_) => "E200",
            Self::SecurityValidationFailed(..) => "E201",
            Self::PermissionDenied { .. } => "E202",
            Self::UnknownPermission(_) => "E203",
            Self::PluginFailed(..) => "E300",
            Self::Timeout(..) => "E301",
            Self::MethodNotFound(_) => "E302",
            Self::Storage(_) => "E400",
            Self::DatabaseError(_) => "E401",
            Self::Serialization(_) => "E402",
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::NotInitialized => "E801",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::PluginNotFound(_) => Some("warden list".to_string()),
            Self::Blacklisted(id) => Some(format!("warden whitelist {}", id)),
            Self::DependentsActive(id, _) => Some(format!("warden deactivate {} --force", id)),
            Self::PermissionDenied { plugin, .. } => Some(format!("warden permissions pending {}", plugin)),
            Self::UnknownPermission(_) => Some("warden permissions catalog".to_string()),
            Self::Incompatible(id, _) => Some(format!("warden validate {}", id)),
            _ => None,
        }
    }

    /// Whether this error was caused by the plugin itself rather than by host policy
    pub fn is_plugin_fault(&self) -> bool {
        matches!(self, Self::PluginFailed(..) | Self::Timeout(..))
    }
}
