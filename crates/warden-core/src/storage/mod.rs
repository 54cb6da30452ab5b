//! Storage collaborator - opaque async key/value store
//!
//! The orchestration core only ever needs `get`/`set`/`remove` on JSON values
//! under a handful of well-known keys.
//!
//! # Architecture
//!
//! - `memory`: in-process store for tests and ephemeral hosts
//! - `sqlite`: single-table SQLite store for the CLI and long-lived hosts

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, SqliteStoreConfig};

/// Plugin active/inactive map
pub const PLUGIN_STATES_KEY: &str = "plugins.states";
/// Security level and active checks
pub const SECURITY_SETTINGS_KEY: &str = "security.settings";
/// Blacklisted plugin ids
pub const BLACKLIST_KEY: &str = "security.blacklist";
/// Permission records and pending requests
pub const PERMISSIONS_KEY: &str = "permissions.records";
/// Persisted audit entries
pub const AUDIT_LOG_KEY: &str = "audit.log";

/// Async key/value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value; `None` when the key is absent
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove a key; removing an absent key succeeds
    async fn remove(&self, key: &str) -> Result<()>;

    /// Read a value, falling back to `default` when absent
    async fn get_or(&self, key: &str, default: Value) -> Result<Value> {
        Ok(self.get(key).await?.unwrap_or(default))
    }
}
