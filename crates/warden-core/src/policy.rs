//! Shared policy vocabulary
//!
//! The security level is the one global dial every enforcement component
//! reads; severity is the common scale for security signals and audit entries.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Global security level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// Development mode: broad auto-approval, loose quotas
    Low,
    /// Default production mode
    #[default]
    Normal,
    /// Strict mode: narrow auto-approval, tight quotas, fail-closed method access
    High,
}

impl SecurityLevel {
    pub const ALL: [SecurityLevel; 3] = [Self::Low, Self::Normal, Self::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SecurityLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(Error::InvalidInput(format!(
                "Invalid security level: {}. Valid options: low, normal, high",
                other
            ))),
        }
    }
}

/// Severity of a security signal or audit entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    /// One tier up, saturating at critical
    pub fn escalate(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit persistence strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditMode {
    /// Write-through on every entry
    Immediate,
    /// Queue entries and flush on a timer
    Batch,
}

impl AuditMode {
    /// Mode implied by a security level when none is configured
    pub fn for_level(level: SecurityLevel) -> Self {
        match level {
            SecurityLevel::High => Self::Immediate,
            SecurityLevel::Low | SecurityLevel::Normal => Self::Batch,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Batch => "batch",
        }
    }
}

impl fmt::Display for AuditMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AuditMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "batch" => Ok(Self::Batch),
            other => Err(Error::InvalidInput(format!(
                "Invalid audit mode: {}. Valid options: immediate, batch",
                other
            ))),
        }
    }
}

/// Named security checks that can be toggled at runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveChecks {
    pub compatibility: bool,
    pub static_analysis: bool,
    pub permission_enforcement: bool,
    pub resource_monitoring: bool,
    pub execution_timeouts: bool,
}

impl Default for ActiveChecks {
    fn default() -> Self {
        Self {
            compatibility: true,
            static_analysis: true,
            permission_enforcement: true,
            resource_monitoring: true,
            execution_timeouts: true,
        }
    }
}

impl ActiveChecks {
    pub const NAMES: [&'static str; 5] = [
        "compatibility",
        "static_analysis",
        "permission_enforcement",
        "resource_monitoring",
        "execution_timeouts",
    ];

    pub fn get(&self, name: &str) -> Option<bool> {
        match name {
            "compatibility" => Some(self.compatibility),
            "static_analysis" => Some(self.static_analysis),
            "permission_enforcement" => Some(self.permission_enforcement),
            "resource_monitoring" => Some(self.resource_monitoring),
            "execution_timeouts" => Some(self.execution_timeouts),
            _ => None,
        }
    }

    /// Toggle a check by name
    pub fn set(&mut self, name: &str, enabled: bool) -> crate::Result<()> {
        let slot = match name {
            "compatibility" => &mut self.compatibility,
            "static_analysis" => &mut self.static_analysis,
            "permission_enforcement" => &mut self.permission_enforcement,
            "resource_monitoring" => &mut self.resource_monitoring,
            "execution_timeouts" => &mut self.execution_timeouts,
            _ => {
                return Err(Error::InvalidInput(format!(
                    "Unknown security check: {}. Valid checks: {}",
                    name,
                    Self::NAMES.join(", ")
                )));
            }
        };
        *slot = enabled;
        Ok(())
    }
}
