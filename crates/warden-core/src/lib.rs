//! Warden Core Library
//!
//! Shared building blocks for the plugin governor:
//! - Error taxonomy with stable codes
//! - Configuration (TOML file + dotted-key access)
//! - Security level, severity and audit mode vocabulary
//! - Typed event bus
//! - Key/value storage collaborator (in-memory and SQLite)

pub mod config;
pub mod error;
pub mod events;
pub mod policy;
pub mod storage;

#[cfg(test)]
mod config_tests;
#[cfg(test)]
mod error_tests;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WardenConfig;
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventBus, EventSubscriber, PluginEvent, Topic};
    pub use crate::policy::{ActiveChecks, AuditMode, SecurityLevel, Severity};
    pub use crate::storage::{KeyValueStore, MemoryStore, SqliteStore};
}
