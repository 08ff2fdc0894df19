use crate::core::config::{RetentionConfig, SECONDS_PER_DAY};
use crate::core::db::json_column;
use crate::core::error::{self, DecisioningError};
use crate::core::output::{compact_line, preview_json};
use crate::core::registry::EntityRef;
use crate::core::store::Store;
use crate::core::time::{Timestamp, command_envelope};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

// --- State machine ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyState {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl IdempotencyState {
    pub fn as_str(self) -> &'static str {
        match self {
            IdempotencyState::Pending => "pending",
            IdempotencyState::Processing => "processing",
            IdempotencyState::Succeeded => "succeeded",
            IdempotencyState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, IdempotencyState::Succeeded | IdempotencyState::Failed)
    }
}

impl fmt::Display for IdempotencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdempotencyState {
    type Err = DecisioningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(IdempotencyState::Pending),
            "processing" => Ok(IdempotencyState::Processing),
            "succeeded" => Ok(IdempotencyState::Succeeded),
            "failed" => Ok(IdempotencyState::Failed),
            other => Err(DecisioningError::ValidationError(format!(
                "unknown idempotency state '{}'",
                other
            ))),
        }
    }
}

/// One row of `idempotency_keys`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub id: i64,
    pub scope: String,
    pub key: String,
    /// sha256 of the caller's request fingerprint; empty when none was given
    pub request_hash: String,
    pub state: IdempotencyState,
    pub locked_at: Option<Timestamp>,
    pub error_code: String,
    pub error_message: String,
    pub response_snapshot: Option<JsonValue>,
    pub result_ref: Option<EntityRef>,
    pub created_at: Timestamp,
    pub expires_at: Option<Timestamp>,
}

impl IdempotencyRecord {
    /// `scope:key`, the intent ref used in the audit log.
    pub fn intent_ref(&self) -> String {
        format!("{}:{}", self.scope, self.key)
    }

    fn invalid(&self, to: IdempotencyState) -> DecisioningError {
        DecisioningError::InvalidTransition {
            scope: self.scope.clone(),
            key: self.key.clone(),
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }

    /// PENDING, FAILED or PROCESSING -> PROCESSING. Clears any previous error
    /// and stamps `locked_at`.
    pub fn begin_processing(&mut self, now: Timestamp) -> Result<(), DecisioningError> {
        if self.state == IdempotencyState::Succeeded {
            return Err(self.invalid(IdempotencyState::Processing));
        }
        self.state = IdempotencyState::Processing;
        self.locked_at = Some(now);
        self.error_code.clear();
        self.error_message.clear();
        Ok(())
    }

    pub fn succeed(
        &mut self,
        snapshot: JsonValue,
        result_ref: Option<EntityRef>,
    ) -> Result<(), DecisioningError> {
        if self.state != IdempotencyState::Processing {
            return Err(self.invalid(IdempotencyState::Succeeded));
        }
        self.state = IdempotencyState::Succeeded;
        self.response_snapshot = Some(snapshot);
        self.result_ref = result_ref;
        self.error_code.clear();
        self.error_message.clear();
        Ok(())
    }

    pub fn fail(&mut self, code: &str, message: &str) -> Result<(), DecisioningError> {
        if self.state != IdempotencyState::Processing {
            return Err(self.invalid(IdempotencyState::Failed));
        }
        self.state = IdempotencyState::Failed;
        self.error_code = code.to_string();
        self.error_message = message.to_string();
        Ok(())
    }
}

/// Insert parameters for a new key.
#[derive(Debug, Clone, PartialEq)]
pub struct NewKey {
    pub scope: String,
    pub key: String,
    pub request_hash: String,
    pub state: IdempotencyState,
    pub locked_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub expires_at: Option<Timestamp>,
}

impl NewKey {
    pub fn pending(scope: &str, key: &str, now: Timestamp) -> Self {
        Self {
            scope: scope.to_string(),
            key: key.to_string(),
            request_hash: String::new(),
            state: IdempotencyState::Pending,
            locked_at: None,
            created_at: now,
            expires_at: None,
        }
    }

    /// Created straight into PROCESSING, the way the wrapper claims a key.
    pub fn processing(scope: &str, key: &str, now: Timestamp) -> Self {
        Self {
            state: IdempotencyState::Processing,
            locked_at: Some(now),
            ..Self::pending(scope, key, now)
        }
    }

    pub fn request_hash(mut self, hash: impl Into<String>) -> Self {
        self.request_hash = hash.into();
        self
    }

    pub fn expires_at(mut self, at: Option<Timestamp>) -> Self {
        self.expires_at = at;
        self
    }
}

// --- Persistence ---

const KEY_COLUMNS: &str = "id, scope, key, request_hash, state, locked_at, error_code, error_message, response_snapshot, result_type, result_id, created_at, expires_at";

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<IdempotencyRecord> {
    let state_raw: String = row.get(4)?;
    let state = state_raw.parse::<IdempotencyState>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let result_type: Option<String> = row.get(9)?;
    let result_id: String = row.get(10)?;
    Ok(IdempotencyRecord {
        id: row.get(0)?,
        scope: row.get(1)?,
        key: row.get(2)?,
        request_hash: row.get(3)?,
        state,
        locked_at: row.get(5)?,
        error_code: row.get(6)?,
        error_message: row.get(7)?,
        response_snapshot: json_column(row.get(8)?)?,
        result_ref: result_type.map(|t| EntityRef::new(t, result_id)),
        created_at: row.get(11)?,
        expires_at: row.get(12)?,
    })
}

fn snapshot_text(snapshot: &Option<JsonValue>) -> Result<Option<String>, DecisioningError> {
    snapshot
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(DecisioningError::from)
}

/// Insert a key. A second insert for the same (scope, key) is rejected by the
/// UNIQUE constraint and reported as `DuplicateKey`.
pub fn create_key(conn: &Connection, new: &NewKey) -> Result<IdempotencyRecord, DecisioningError> {
    let inserted = conn.execute(
        "INSERT INTO idempotency_keys(scope, key, request_hash, state, locked_at, created_at, expires_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            new.scope,
            new.key,
            new.request_hash,
            new.state.as_str(),
            new.locked_at,
            new.created_at,
            new.expires_at,
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(e) if error::is_unique_violation(&e) => {
            return Err(DecisioningError::DuplicateKey {
                scope: new.scope.clone(),
                key: new.key.clone(),
            });
        }
        Err(e) => return Err(e.into()),
    }
    Ok(IdempotencyRecord {
        id: conn.last_insert_rowid(),
        scope: new.scope.clone(),
        key: new.key.clone(),
        request_hash: new.request_hash.clone(),
        state: new.state,
        locked_at: new.locked_at,
        error_code: String::new(),
        error_message: String::new(),
        response_snapshot: None,
        result_ref: None,
        created_at: new.created_at,
        expires_at: new.expires_at,
    })
}

pub fn get_key(
    conn: &Connection,
    scope: &str,
    key: &str,
) -> Result<Option<IdempotencyRecord>, DecisioningError> {
    let sql = format!(
        "SELECT {} FROM idempotency_keys WHERE scope = ?1 AND key = ?2",
        KEY_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![scope, key], key_from_row)
        .optional()?)
}

/// Write every mutable column of `record` back by id.
pub fn save_key(conn: &Connection, record: &IdempotencyRecord) -> Result<(), DecisioningError> {
    let (result_type, result_id) = match &record.result_ref {
        Some(r) => (Some(r.type_tag.as_str()), r.id.as_str()),
        None => (None, ""),
    };
    let changed = conn.execute(
        "UPDATE idempotency_keys
         SET request_hash = ?1, state = ?2, locked_at = ?3, error_code = ?4, error_message = ?5,
             response_snapshot = ?6, result_type = ?7, result_id = ?8, expires_at = ?9
         WHERE id = ?10",
        params![
            record.request_hash,
            record.state.as_str(),
            record.locked_at,
            record.error_code,
            record.error_message,
            snapshot_text(&record.response_snapshot)?,
            result_type,
            result_id,
            record.expires_at,
            record.id,
        ],
    )?;
    if changed == 0 {
        return Err(DecisioningError::NotFound(format!(
            "idempotency key {} no longer exists",
            record.intent_ref()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFilter {
    pub scope: Option<String>,
    pub state: Option<IdempotencyState>,
    pub limit: Option<i64>,
}

pub fn query_keys(conn: &Connection, filter: &KeyFilter) -> Result<Vec<IdempotencyRecord>, DecisioningError> {
    let mut conditions: Vec<String> = vec![];
    let mut param_values: Vec<rusqlite::types::Value> = vec![];

    if let Some(scope) = &filter.scope {
        param_values.push(scope.clone().into());
        conditions.push(format!("scope = ?{}", param_values.len()));
    }
    if let Some(state) = filter.state {
        param_values.push(state.as_str().to_string().into());
        conditions.push(format!("state = ?{}", param_values.len()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    let limit_clause = match filter.limit {
        Some(limit) => {
            param_values.push(limit.into());
            format!(" LIMIT ?{}", param_values.len())
        }
        None => String::new(),
    };

    let sql = format!(
        "SELECT {} FROM idempotency_keys{} ORDER BY created_at, id{}",
        KEY_COLUMNS, where_clause, limit_clause
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(param_values.iter()), key_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn find_key(
    store: &Store,
    scope: &str,
    key: &str,
) -> Result<Option<IdempotencyRecord>, DecisioningError> {
    let conn = store.connect()?;
    get_key(&conn, scope, key)
}

pub fn list_keys(store: &Store, filter: &KeyFilter) -> Result<Vec<IdempotencyRecord>, DecisioningError> {
    store
        .broker()
        .with_conn("cli", None, "idempotency.list", |conn| query_keys(conn, filter))
}

// --- Retention sweep ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOptions {
    pub days: i64,
    pub include_processing: bool,
    pub dry_run: bool,
}

impl CleanupOptions {
    pub fn from_config(retention: &RetentionConfig) -> Self {
        Self {
            days: retention.days,
            include_processing: retention.include_processing,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub matched: usize,
    pub deleted: usize,
    pub dry_run: bool,
    pub days: i64,
    pub cutoff: Timestamp,
}

impl CleanupReport {
    pub fn summary(&self) -> String {
        if self.dry_run {
            format!(
                "Would delete {} idempotency key(s) older than {} day(s) or past expiry",
                self.matched, self.days
            )
        } else {
            format!(
                "Deleted {} idempotency key(s) older than {} day(s) or past expiry",
                self.deleted, self.days
            )
        }
    }
}

const CLEANUP_WHERE: &str = "(created_at < ?1 OR (expires_at IS NOT NULL AND expires_at < ?2))
     AND (?3 OR state <> 'processing')";

/// Delete keys created before `now - days` or whose `expires_at` has passed.
/// PROCESSING rows may still be in flight and are kept unless
/// `include_processing` is set.
pub fn cleanup_keys(store: &Store, opts: CleanupOptions) -> Result<CleanupReport, DecisioningError> {
    if opts.days < 0 {
        return Err(DecisioningError::ValidationError(format!(
            "days must be >= 0, got {}",
            opts.days
        )));
    }
    let secs = opts.days.checked_mul(SECONDS_PER_DAY).ok_or_else(|| {
        DecisioningError::ValidationError(format!("days is too large, got {}", opts.days))
    })?;
    let now = store.now();
    let cutoff = now.saturating_sub(time::Duration::seconds(secs));
    store
        .broker()
        .with_tx("cli", None, "idempotency.cleanup", |tx| {
            let matched: i64 = tx.query_row(
                &format!("SELECT COUNT(*) FROM idempotency_keys WHERE {}", CLEANUP_WHERE),
                params![cutoff, now, opts.include_processing],
                |row| row.get(0),
            )?;
            let deleted = if opts.dry_run {
                0
            } else {
                tx.execute(
                    &format!("DELETE FROM idempotency_keys WHERE {}", CLEANUP_WHERE),
                    params![cutoff, now, opts.include_processing],
                )?
            };
            Ok(CleanupReport {
                matched: usize::try_from(matched).unwrap_or_default(),
                deleted,
                dry_run: opts.dry_run,
                days: opts.days,
                cutoff,
            })
        })
}

// --- CLI ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[clap(name = "keys", about = "Inspect and sweep idempotency keys.")]
pub struct KeysCli {
    #[clap(subcommand)]
    pub command: KeysCommand,
}

#[derive(Subcommand, Debug)]
pub enum KeysCommand {
    /// List idempotency keys.
    List {
        /// Only keys in this scope
        #[clap(long)]
        scope: Option<String>,
        /// Only keys in this state
        #[clap(long, value_enum)]
        state: Option<IdempotencyState>,
        #[clap(long)]
        limit: Option<i64>,
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Show one key with its cached snapshot.
    Show {
        #[clap(long)]
        scope: String,
        #[clap(long)]
        key: String,
    },
    /// Delete old or expired keys.
    Cleanup {
        /// Age cutoff in days (defaults to [retention].days)
        #[clap(long)]
        days: Option<i64>,
        /// Count only, delete nothing
        #[clap(long)]
        dry_run: bool,
        /// Also delete stale PROCESSING keys
        #[clap(long)]
        include_processing: bool,
    },
    /// Print JSON schema for the keys subsystem.
    Schema,
}

pub fn schema() -> JsonValue {
    serde_json::json!({
        "name": "keys",
        "version": "0.3.0",
        "description": "Idempotency key state machine keyed by (scope, key)",
        "commands": [
            { "name": "list", "description": "List idempotency keys" },
            { "name": "show", "description": "Show one key with its cached snapshot" },
            { "name": "cleanup", "description": "Delete old or expired keys" },
            { "name": "schema", "description": "Print subsystem schema" }
        ],
        "states": ["pending", "processing", "succeeded", "failed"],
        "storage": ["idempotency_keys"],
    })
}

fn state_label(state: IdempotencyState) -> colored::ColoredString {
    match state {
        IdempotencyState::Pending => state.as_str().normal(),
        IdempotencyState::Processing => state.as_str().yellow(),
        IdempotencyState::Succeeded => state.as_str().green(),
        IdempotencyState::Failed => state.as_str().red(),
    }
}

pub fn run_keys_cli(store: &Store, cli: KeysCli) -> Result<(), DecisioningError> {
    match cli.command {
        KeysCommand::List {
            scope,
            state,
            limit,
            format,
        } => {
            let keys = list_keys(store, &KeyFilter { scope, state, limit })?;
            match format {
                OutputFormat::Json => {
                    let envelope = command_envelope(
                        "keys.list",
                        "ok",
                        serde_json::json!({ "count": keys.len(), "keys": keys }),
                    );
                    println!("{}", serde_json::to_string_pretty(&envelope)?);
                }
                OutputFormat::Text => {
                    if keys.is_empty() {
                        println!("{}", "no idempotency keys".dimmed());
                    }
                    for k in &keys {
                        let detail = match k.state {
                            IdempotencyState::Failed => {
                                format!("{}: {}", k.error_code, compact_line(&k.error_message, 60))
                            }
                            _ => preview_json(k.response_snapshot.as_ref(), 60),
                        };
                        println!(
                            "{} {} {} {}",
                            k.intent_ref().bold(),
                            state_label(k.state),
                            k.created_at.to_string().dimmed(),
                            detail
                        );
                    }
                }
            }
        }

        KeysCommand::Show { scope, key } => {
            let record = find_key(store, &scope, &key)?.ok_or_else(|| {
                DecisioningError::NotFound(format!("idempotency key {}:{} not found", scope, key))
            })?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        KeysCommand::Cleanup {
            days,
            dry_run,
            include_processing,
        } => {
            let mut opts = CleanupOptions::from_config(&store.config.retention);
            if let Some(days) = days {
                opts.days = days;
            }
            opts.dry_run = dry_run;
            opts.include_processing |= include_processing;
            let report = cleanup_keys(store, opts)?;
            if report.dry_run {
                println!("{}", report.summary().yellow());
            } else {
                println!("{}", report.summary().green());
            }
        }

        KeysCommand::Schema => {
            println!("{}", serde_json::to_string_pretty(&schema())?);
        }
    }
    Ok(())
}
