//! Effective-dated role assignments.
//!
//! Revoking an assignment closes its window instead of deleting it, so
//! "which roles did this subject hold at T" stays answerable for any T.

use crate::core::asof::{EffectiveDated, Query, ValidityWindow};
use crate::core::error::DecisioningError;
use crate::core::registry::Entity;
use crate::core::store::Store;
use crate::core::time::Timestamp;
use clap::{Parser, Subcommand};
use colored::Colorize;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub id: String,
    pub subject: String,
    pub role: String,
    pub assigned_by: Option<String>,
    pub assigned_at: Timestamp,
    pub is_primary: bool,
    pub valid_from: Timestamp,
    pub valid_to: Option<Timestamp>,
}

impl EffectiveDated for RoleAssignment {
    fn validity(&self) -> ValidityWindow {
        ValidityWindow {
            valid_from: self.valid_from,
            valid_to: self.valid_to,
        }
    }
}

impl Entity for RoleAssignment {
    const TYPE_TAG: &'static str = "role_assignment";

    fn entity_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewAssignment {
    pub subject: String,
    pub role: String,
    pub assigned_by: Option<String>,
    pub is_primary: bool,
    /// Defaults to now
    pub valid_from: Option<Timestamp>,
    pub valid_to: Option<Timestamp>,
}

impl NewAssignment {
    pub fn new(subject: &str, role: &str) -> Self {
        Self {
            subject: subject.to_string(),
            role: role.to_string(),
            ..Self::default()
        }
    }

    pub fn assigned_by(mut self, who: &str) -> Self {
        self.assigned_by = Some(who.to_string());
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn valid_from(mut self, at: Timestamp) -> Self {
        self.valid_from = Some(at);
        self
    }

    pub fn valid_to(mut self, at: Timestamp) -> Self {
        self.valid_to = Some(at);
        self
    }
}

const ASSIGNMENT_COLUMNS: &str =
    "id, subject, role, assigned_by, assigned_at, is_primary, valid_from, valid_to";

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<RoleAssignment> {
    Ok(RoleAssignment {
        id: row.get(0)?,
        subject: row.get(1)?,
        role: row.get(2)?,
        assigned_by: row.get(3)?,
        assigned_at: row.get(4)?,
        is_primary: row.get(5)?,
        valid_from: row.get(6)?,
        valid_to: row.get(7)?,
    })
}

pub fn assign_role(store: &Store, new: &NewAssignment) -> Result<RoleAssignment, DecisioningError> {
    if new.subject.trim().is_empty() || new.role.trim().is_empty() {
        return Err(DecisioningError::ValidationError(
            "role assignment requires a subject and a role".to_string(),
        ));
    }
    let now = store.now();
    let window = ValidityWindow::new(new.valid_from.unwrap_or(now), new.valid_to)?;
    let assignment = RoleAssignment {
        id: format!("RA_{}", Ulid::new()),
        subject: new.subject.clone(),
        role: new.role.clone(),
        assigned_by: new.assigned_by.clone(),
        assigned_at: now,
        is_primary: new.is_primary,
        valid_from: window.valid_from,
        valid_to: window.valid_to,
    };
    let actor = new.assigned_by.as_deref().unwrap_or("cli");
    store
        .broker()
        .with_tx(actor, Some(&assignment.subject), "roles.assign", |tx| {
            tx.execute(
                "INSERT INTO role_assignments(id, subject, role, assigned_by, assigned_at, is_primary, valid_from, valid_to)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    assignment.id,
                    assignment.subject,
                    assignment.role,
                    assignment.assigned_by,
                    assignment.assigned_at,
                    assignment.is_primary,
                    assignment.valid_from,
                    assignment.valid_to,
                ],
            )?;
            Ok(())
        })?;
    Ok(assignment)
}

pub fn load_assignment(conn: &Connection, id: &str) -> Result<Option<RoleAssignment>, DecisioningError> {
    let sql = format!(
        "SELECT {} FROM role_assignments WHERE id = ?1",
        ASSIGNMENT_COLUMNS
    );
    Ok(conn.query_row(&sql, params![id], assignment_from_row).optional()?)
}

pub fn get_assignment(store: &Store, id: &str) -> Result<RoleAssignment, DecisioningError> {
    let conn = store.connect()?;
    load_assignment(&conn, id)?
        .ok_or_else(|| DecisioningError::NotFound(format!("Role assignment '{}' not found", id)))
}

/// End an assignment at `at` (default now). The window must stay non-empty,
/// and an assignment that has already ended cannot be revoked again.
pub fn revoke_role(
    store: &Store,
    id: &str,
    at: Option<Timestamp>,
) -> Result<RoleAssignment, DecisioningError> {
    let at = at.unwrap_or_else(|| store.now());
    store.broker().with_tx("cli", Some(id), "roles.revoke", |tx| {
        let mut assignment = load_assignment(tx, id)?.ok_or_else(|| {
            DecisioningError::NotFound(format!("Role assignment '{}' not found", id))
        })?;
        if assignment.valid_to.is_some_and(|end| end <= at) {
            return Err(DecisioningError::ValidationError(format!(
                "Role assignment '{}' already ended",
                id
            )));
        }
        let window = ValidityWindow::new(assignment.valid_from, Some(at))?;
        assignment.valid_to = window.valid_to;
        tx.execute(
            "UPDATE role_assignments SET valid_to = ?1 WHERE id = ?2",
            params![at, id],
        )?;
        Ok(assignment)
    })
}

/// Assignments of `subject` valid at `at`: `valid_from <= at < valid_to`.
pub fn roles_as_of(
    store: &Store,
    subject: &str,
    at: Timestamp,
) -> Result<Vec<RoleAssignment>, DecisioningError> {
    let query = Query::select("role_assignments", ASSIGNMENT_COLUMNS)
        .as_of(at)
        .filter_eq("subject", subject.to_string())
        .order_by("valid_from, id");
    let conn = store.connect()?;
    query.fetch(&conn, assignment_from_row)
}

pub fn current_roles(store: &Store, subject: &str) -> Result<Vec<RoleAssignment>, DecisioningError> {
    roles_as_of(store, subject, store.now())
}

/// Every assignment of `subject`, ended or not.
pub fn assignment_history(store: &Store, subject: &str) -> Result<Vec<RoleAssignment>, DecisioningError> {
    let conn = store.connect()?;
    Query::select("role_assignments", ASSIGNMENT_COLUMNS)
        .filter_eq("subject", subject.to_string())
        .order_by("valid_from, id")
        .fetch(&conn, assignment_from_row)
}

/// Resolver for `role_assignment` references.
pub fn resolve_assignment_json(
    conn: &Connection,
    id: &str,
) -> Result<Option<JsonValue>, DecisioningError> {
    load_assignment(conn, id)?
        .map(|a| serde_json::to_value(a).map_err(DecisioningError::from))
        .transpose()
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "roles", about = "Effective-dated role assignments.")]
pub struct RolesCli {
    #[clap(subcommand)]
    pub command: RolesCommand,
}

#[derive(Subcommand, Debug)]
pub enum RolesCommand {
    /// Assign a role to a subject.
    Assign {
        #[clap(long)]
        subject: String,
        #[clap(long)]
        role: String,
        #[clap(long)]
        assigned_by: Option<String>,
        #[clap(long)]
        primary: bool,
        /// RFC 3339 (defaults to now)
        #[clap(long)]
        valid_from: Option<String>,
        /// RFC 3339; open-ended when omitted
        #[clap(long)]
        valid_to: Option<String>,
    },
    /// End an assignment.
    Revoke {
        #[clap(long)]
        id: String,
        /// RFC 3339 (defaults to now)
        #[clap(long)]
        at: Option<String>,
    },
    /// List a subject's roles as of a time (default now).
    List {
        #[clap(long)]
        subject: String,
        #[clap(long)]
        as_of: Option<String>,
        /// Include ended and future assignments
        #[clap(long, conflicts_with = "as_of")]
        all: bool,
    },
    /// Print JSON schema for the roles subsystem.
    Schema,
}

pub fn schema() -> JsonValue {
    serde_json::json!({
        "name": "roles",
        "version": "0.3.0",
        "description": "Effective-dated role assignments",
        "commands": [
            { "name": "assign", "description": "Assign a role to a subject" },
            { "name": "revoke", "description": "End an assignment" },
            { "name": "list", "description": "List a subject's roles as of a time" },
            { "name": "schema", "description": "Print subsystem schema" }
        ],
        "storage": ["role_assignments"],
        "entity_type": RoleAssignment::TYPE_TAG,
    })
}

fn parse_opt_time(raw: Option<String>) -> Result<Option<Timestamp>, DecisioningError> {
    raw.as_deref().map(Timestamp::parse_rfc3339).transpose()
}

pub fn run_roles_cli(store: &Store, cli: RolesCli) -> Result<(), DecisioningError> {
    match cli.command {
        RolesCommand::Assign {
            subject,
            role,
            assigned_by,
            primary,
            valid_from,
            valid_to,
        } => {
            let new = NewAssignment {
                subject,
                role,
                assigned_by,
                is_primary: primary,
                valid_from: parse_opt_time(valid_from)?,
                valid_to: parse_opt_time(valid_to)?,
            };
            let assignment = assign_role(store, &new)?;
            println!("{}", serde_json::to_string_pretty(&assignment)?);
        }

        RolesCommand::Revoke { id, at } => {
            let assignment = revoke_role(store, &id, parse_opt_time(at)?)?;
            println!("{}", serde_json::to_string_pretty(&assignment)?);
        }

        RolesCommand::List {
            subject,
            as_of,
            all,
        } => {
            let assignments = if all {
                assignment_history(store, &subject)?
            } else {
                let at = parse_opt_time(as_of)?.unwrap_or_else(|| store.now());
                roles_as_of(store, &subject, at)?
            };
            if assignments.is_empty() {
                println!("{}", "no role assignments".dimmed());
            }
            for a in &assignments {
                let until = a
                    .valid_to
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "open".to_string());
                let primary = if a.is_primary { " (primary)" } else { "" };
                println!(
                    "{} {}{} {} .. {}",
                    a.id.dimmed(),
                    a.role.bright_cyan(),
                    primary,
                    a.valid_from,
                    until
                );
            }
        }

        RolesCommand::Schema => {
            println!("{}", serde_json::to_string_pretty(&schema())?);
        }
    }
    Ok(())
}
