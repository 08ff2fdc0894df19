use crate::core::error;
use crate::core::schemas;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

pub fn db_connect(db_path: &Path, busy_timeout_secs: u64) -> Result<Connection, error::DecisioningError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(busy_timeout_secs))
        .map_err(error::DecisioningError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::DecisioningError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::DecisioningError::RusqliteError)?;
    Ok(conn)
}

/// Apply every table, index and trigger. Safe to run repeatedly.
pub fn initialize_schema(conn: &Connection) -> Result<(), error::DecisioningError> {
    for schema in schemas::all_schemas() {
        conn.execute_batch(schema)?;
    }
    Ok(())
}

pub(crate) fn json_column(raw: Option<String>) -> rusqlite::Result<Option<serde_json::Value>> {
    raw.map(|text| {
        serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}
