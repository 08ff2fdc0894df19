//! Store configuration loaded from `decisioning.toml`.
//!
//! A missing file means defaults. A file that exists but does not parse is an
//! error, never silently ignored.

use crate::core::error::DecisioningError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "decisioning.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub idempotency: IdempotencyConfig,
    pub retention: RetentionConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub file_name: String,
    pub busy_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            file_name: "decisioning.db".to_string(),
            busy_timeout_secs: 5,
        }
    }
}

/// How long the idempotency lock is held.
///
/// `Relaxed` holds it only while the record is fetched or created. A caller
/// arriving while another is still PROCESSING re-enters and runs the
/// operation again, so only the terminal state is single-writer.
///
/// `HoldForExecution` keeps one immediate transaction open across acquire,
/// execute and mark-succeeded. Concurrent callers queue on the database lock
/// and replay the stored result once the first commits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    #[default]
    Relaxed,
    HoldForExecution,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub lock_policy: LockPolicy,
    /// When set, new keys get `expires_at = created_at + ttl`.
    pub default_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub days: i64,
    pub include_processing: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 7,
            include_processing: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub file_name: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file_name: "broker.events.jsonl".to_string(),
        }
    }
}

/// Load `decisioning.toml` from the store root.
pub fn load_config(root: &Path) -> Result<Config, DecisioningError> {
    let config_path = root.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(&config_path).map_err(DecisioningError::IoError)?;
    parse_config(&content)
}

pub(crate) const SECONDS_PER_DAY: i64 = 86_400;

pub fn parse_config(content: &str) -> Result<Config, DecisioningError> {
    let config: Config = toml::from_str(content)
        .map_err(|e| DecisioningError::ConfigFileError(e.to_string()))?;
    if config.retention.days < 0 {
        return Err(DecisioningError::ConfigFileError(format!(
            "retention.days must be >= 0, got {}",
            config.retention.days
        )));
    }
    if config.retention.days.checked_mul(SECONDS_PER_DAY).is_none() {
        return Err(DecisioningError::ConfigFileError(format!(
            "retention.days is too large, got {}",
            config.retention.days
        )));
    }
    Ok(config)
}
