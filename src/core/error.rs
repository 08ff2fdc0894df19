use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecisioningError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config file error: {0}")]
    ConfigFileError(String),
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Idempotency key already exists: {scope}:{key}")]
    DuplicateKey { scope: String, key: String },
    #[error("Request fingerprint mismatch for idempotency key {scope}:{key}")]
    RequestMismatch { scope: String, key: String },
    #[error("Invalid state transition for {scope}:{key}: {from} -> {to}")]
    InvalidTransition {
        scope: String,
        key: String,
        from: String,
        to: String,
    },
    #[error("Time error: {0}")]
    TimeError(String),
}

/// Misuse of the idempotent wrapper, detected before the store is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("idempotent wrapper requires a non-empty scope")]
    MissingScope,
    #[error("cannot derive idempotency key: no key_from provided and no usable argument")]
    NoKey,
}

impl DecisioningError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, DecisioningError::Configuration(_))
    }

    /// True when SQLite rejected a write because of a UNIQUE/PRIMARY KEY constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DecisioningError::DuplicateKey { .. } => true,
            DecisioningError::RusqliteError(err) => is_unique_violation(err),
            _ => false,
        }
    }
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => {
            code.code == rusqlite::ErrorCode::ConstraintViolation
                && matches!(
                    code.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
        }
        _ => false,
    }
}
