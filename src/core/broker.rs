use crate::core::db;
use crate::core::error;
use crate::core::time::{Timestamp, new_event_id};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// The DB Broker is the "Thin Waist" for state access.
///
/// Every read or write goes through a fresh connection handed out here, and
/// every named operation leaves one line in the audit log. Serialization of
/// writers is SQLite's job: `with_tx` opens `BEGIN IMMEDIATE`, which blocks
/// until the database write lock is free (bounded by the busy timeout).
#[derive(Debug, Clone)]
pub struct DbBroker {
    db_path: PathBuf,
    busy_timeout_secs: u64,
    audit_log_path: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub intent_ref: Option<String>,
    pub op: String,
    pub db_id: String,
    pub status: String,
}

impl DbBroker {
    pub fn new(db_path: &Path, busy_timeout_secs: u64, audit_log_path: Option<PathBuf>) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
            busy_timeout_secs,
            audit_log_path,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn connect(&self) -> Result<Connection, error::DecisioningError> {
        db::db_connect(&self.db_path, self.busy_timeout_secs)
    }

    /// Execute a closure with a fresh connection to the store DB.
    pub fn with_conn<F, R>(
        &self,
        actor: &str,
        intent_ref: Option<&str>,
        op_name: &str,
        f: F,
    ) -> Result<R, error::DecisioningError>
    where
        F: FnOnce(&Connection) -> Result<R, error::DecisioningError>,
    {
        let conn = self.connect()?;
        let result = f(&conn);
        self.log_status(actor, intent_ref, op_name, result.is_ok())?;
        result
    }

    /// Execute a closure inside an immediate (write-locked) transaction.
    /// Commits on `Ok`, rolls back on `Err`.
    pub fn with_tx<F, R>(
        &self,
        actor: &str,
        intent_ref: Option<&str>,
        op_name: &str,
        f: F,
    ) -> Result<R, error::DecisioningError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R, error::DecisioningError>,
    {
        let mut conn = self.connect()?;
        let result = Self::run_in_tx(&mut conn, f);
        self.log_status(actor, intent_ref, op_name, result.is_ok())?;
        result
    }

    fn run_in_tx<F, R>(conn: &mut Connection, f: F) -> Result<R, error::DecisioningError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R, error::DecisioningError>,
    {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn log_status(
        &self,
        actor: &str,
        intent_ref: Option<&str>,
        op: &str,
        ok: bool,
    ) -> Result<(), error::DecisioningError> {
        let status = if ok { "success" } else { "error" };
        self.log_event(actor, intent_ref, op, status)
    }

    /// Append one event to the audit log. A no-op when auditing is disabled.
    pub fn log_event(
        &self,
        actor: &str,
        intent_ref: Option<&str>,
        op: &str,
        status: &str,
    ) -> Result<(), error::DecisioningError> {
        let Some(audit_log_path) = &self.audit_log_path else {
            return Ok(());
        };

        let ev = BrokerEvent {
            ts: Timestamp::now().to_rfc3339(),
            event_id: new_event_id(),
            actor: actor.to_string(),
            intent_ref: intent_ref.map(|s| s.to_string()),
            op: op.to_string(),
            db_id: self
                .db_path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            status: status.to_string(),
        };

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(audit_log_path)
            .map_err(error::DecisioningError::IoError)?;

        let mut line = serde_json::to_string(&ev)?;
        line.push('\n');
        f.write_all(line.as_bytes())
            .map_err(error::DecisioningError::IoError)?;
        Ok(())
    }
}

/// Read the audit log back, oldest first. A missing log reads as empty.
pub fn read_audit_log(path: &Path) -> Result<Vec<BrokerEvent>, error::DecisioningError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line)?);
    }
    Ok(events)
}
