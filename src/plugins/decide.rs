use crate::core::asof::{PointInTime, Query};
use crate::core::db::json_column;
use crate::core::error::DecisioningError;
use crate::core::output::preview_json;
use crate::core::registry::{Entity, EntityRef, TypeRegistry};
use crate::core::store::Store;
use crate::core::time::Timestamp;
use clap::{Parser, Subcommand};
use colored::Colorize;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use ulid::Ulid;

// --- Data Types (DB rows) ---

/// An append-only record of who decided what, on which evidence, and when.
///
/// `effective_at` is business time and may be backdated; `recorded_at` is
/// when the store learned of it. Everything except `outcome` and
/// `finalized_at` is frozen at insert, and those two freeze at finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    pub effective_at: Timestamp,
    pub recorded_at: Timestamp,
    pub actor: String,
    pub on_behalf_of: Option<String>,
    /// Role/org context of the actor at decision time
    pub authority_context: JsonValue,
    pub target: EntityRef,
    pub action: String,
    pub snapshot: JsonValue,
    pub outcome: JsonValue,
    pub finalized_at: Option<Timestamp>,
}

impl DecisionRecord {
    pub fn is_final(&self) -> bool {
        self.finalized_at.is_some()
    }
}

impl Entity for DecisionRecord {
    const TYPE_TAG: &'static str = "decision";

    fn entity_id(&self) -> String {
        self.id.clone()
    }
}

impl PointInTime for DecisionRecord {
    fn effective_at(&self) -> Timestamp {
        self.effective_at
    }
}

/// A decision not yet written.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecisionDraft {
    pub actor: Option<String>,
    pub on_behalf_of: Option<String>,
    pub authority_context: Option<JsonValue>,
    pub target: Option<EntityRef>,
    pub action: String,
    pub snapshot: Option<JsonValue>,
    pub outcome: Option<JsonValue>,
    pub effective_at: Option<Timestamp>,
}

impl DecisionDraft {
    pub fn new(target: EntityRef, action: &str) -> Self {
        Self {
            target: Some(target),
            action: action.to_string(),
            ..Self::default()
        }
    }

    pub fn actor(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }

    pub fn on_behalf_of(mut self, principal: &str) -> Self {
        self.on_behalf_of = Some(principal.to_string());
        self
    }

    pub fn authority_context(mut self, context: JsonValue) -> Self {
        self.authority_context = Some(context);
        self
    }

    /// `{}` is a valid (empty) snapshot; leaving it unset is not.
    pub fn snapshot(mut self, snapshot: JsonValue) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn outcome(mut self, outcome: JsonValue) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn effective_at(mut self, at: Timestamp) -> Self {
        self.effective_at = Some(at);
        self
    }

    pub fn validate(&self) -> Result<(), DecisioningError> {
        if self.actor.as_deref().is_none_or(|a| a.trim().is_empty()) {
            return Err(DecisioningError::ValidationError(
                "decision requires an actor".to_string(),
            ));
        }
        if self.snapshot.is_none() {
            return Err(DecisioningError::ValidationError(
                "decision requires a snapshot".to_string(),
            ));
        }
        if self.action.trim().is_empty() {
            return Err(DecisioningError::ValidationError(
                "decision requires an action".to_string(),
            ));
        }
        match &self.target {
            Some(t) if !t.type_tag.is_empty() && !t.id.is_empty() => Ok(()),
            _ => Err(DecisioningError::ValidationError(
                "decision requires a target".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionFilter {
    pub target: Option<EntityRef>,
    pub target_type: Option<String>,
    pub action: Option<String>,
    pub actor: Option<String>,
    /// Point-event rule: `effective_at <= as_of`
    pub as_of: Option<Timestamp>,
}

// --- Persistence ---

const DECISION_COLUMNS: &str = "id, effective_at, recorded_at, actor, on_behalf_of, authority_context, target_type, target_id, action, snapshot, outcome, finalized_at";

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<DecisionRecord> {
    let target_type: String = row.get(6)?;
    let target_id: String = row.get(7)?;
    Ok(DecisionRecord {
        id: row.get(0)?,
        effective_at: row.get(1)?,
        recorded_at: row.get(2)?,
        actor: row.get(3)?,
        on_behalf_of: row.get(4)?,
        authority_context: json_column(row.get(5)?)?.unwrap_or_else(|| serde_json::json!({})),
        target: EntityRef::new(target_type, target_id),
        action: row.get(8)?,
        snapshot: json_column(row.get(9)?)?.unwrap_or(JsonValue::Null),
        outcome: json_column(row.get(10)?)?.unwrap_or_else(|| serde_json::json!({})),
        finalized_at: row.get(11)?,
    })
}

/// Insert a validated draft on an existing connection or transaction, e.g.
/// from inside an idempotent operation.
pub fn record_decision_tx(
    conn: &Connection,
    draft: &DecisionDraft,
    now: Timestamp,
) -> Result<DecisionRecord, DecisioningError> {
    draft.validate()?;
    let (Some(actor), Some(target), Some(snapshot)) =
        (draft.actor.clone(), draft.target.clone(), draft.snapshot.clone())
    else {
        return Err(DecisioningError::ValidationError(
            "decision draft is incomplete".to_string(),
        ));
    };

    let record = DecisionRecord {
        id: format!("DD_{}", Ulid::new()),
        effective_at: draft.effective_at.unwrap_or(now),
        recorded_at: now,
        actor,
        on_behalf_of: draft.on_behalf_of.clone(),
        authority_context: draft
            .authority_context
            .clone()
            .unwrap_or_else(|| serde_json::json!({})),
        target,
        action: draft.action.clone(),
        snapshot,
        outcome: draft.outcome.clone().unwrap_or_else(|| serde_json::json!({})),
        finalized_at: None,
    };

    conn.execute(
        "INSERT INTO decisions(id, effective_at, recorded_at, actor, on_behalf_of, authority_context, target_type, target_id, action, snapshot, outcome, finalized_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL)",
        params![
            record.id,
            record.effective_at,
            record.recorded_at,
            record.actor,
            record.on_behalf_of,
            serde_json::to_string(&record.authority_context)?,
            record.target.type_tag,
            record.target.id,
            record.action,
            serde_json::to_string(&record.snapshot)?,
            serde_json::to_string(&record.outcome)?,
        ],
    )?;
    Ok(record)
}

pub fn record_decision(store: &Store, draft: &DecisionDraft) -> Result<DecisionRecord, DecisioningError> {
    draft.validate()?;
    let actor = draft.actor.as_deref().unwrap_or("decisioning");
    let intent = draft.target.as_ref().map(|t| t.to_string());
    let now = store.now();
    store
        .broker()
        .with_tx(actor, intent.as_deref(), "decide.record", |tx| {
            record_decision_tx(tx, draft, now)
        })
}

pub fn load_decision(conn: &Connection, id: &str) -> Result<Option<DecisionRecord>, DecisioningError> {
    let sql = format!("SELECT {} FROM decisions WHERE id = ?1", DECISION_COLUMNS);
    Ok(conn.query_row(&sql, params![id], decision_from_row).optional()?)
}

pub fn get_decision(store: &Store, id: &str) -> Result<DecisionRecord, DecisioningError> {
    store.broker().with_conn("cli", None, "decide.get", |conn| {
        load_decision(conn, id)?
            .ok_or_else(|| DecisioningError::NotFound(format!("Decision '{}' not found", id)))
    })
}

pub fn list_decisions(
    store: &Store,
    filter: &DecisionFilter,
) -> Result<Vec<DecisionRecord>, DecisioningError> {
    let mut query = Query::select("decisions", DECISION_COLUMNS);
    if let Some(target) = &filter.target {
        query = query
            .filter_eq("target_type", target.type_tag.clone())
            .filter_eq("target_id", target.id.clone());
    }
    if let Some(target_type) = &filter.target_type {
        query = query.filter_eq("target_type", target_type.clone());
    }
    if let Some(action) = &filter.action {
        query = query.filter_eq("action", action.clone());
    }
    if let Some(actor) = &filter.actor {
        query = query.filter_eq("actor", actor.clone());
    }
    if let Some(at) = filter.as_of {
        query = query.effective_as_of(at);
    }
    let query = query.order_by("effective_at, recorded_at, id");
    store
        .broker()
        .with_conn("cli", None, "decide.list", |conn| query.fetch(conn, decision_from_row))
}

/// Set `finalized_at` (and optionally replace `outcome`). After this the row
/// can no longer change at all.
pub fn finalize_decision(
    store: &Store,
    id: &str,
    outcome: Option<JsonValue>,
) -> Result<DecisionRecord, DecisioningError> {
    let now = store.now();
    store
        .broker()
        .with_tx("cli", Some(id), "decide.finalize", |tx| {
            let mut record = load_decision(tx, id)?
                .ok_or_else(|| DecisioningError::NotFound(format!("Decision '{}' not found", id)))?;
            if record.is_final() {
                return Err(DecisioningError::ValidationError(format!(
                    "Decision '{}' is already final",
                    id
                )));
            }
            if let Some(outcome) = outcome {
                record.outcome = outcome;
            }
            record.finalized_at = Some(now);
            tx.execute(
                "UPDATE decisions SET outcome = ?1, finalized_at = ?2 WHERE id = ?3",
                params![serde_json::to_string(&record.outcome)?, now, id],
            )?;
            Ok(record)
        })
}

/// Look the decision's target up through the caller's registry.
pub fn resolve_target(
    store: &Store,
    registry: &TypeRegistry,
    decision: &DecisionRecord,
) -> Result<JsonValue, DecisioningError> {
    registry.resolve(store, &decision.target)
}

/// Resolver for `decision` references.
pub fn resolve_decision_json(conn: &Connection, id: &str) -> Result<Option<JsonValue>, DecisioningError> {
    load_decision(conn, id)?
        .map(|d| serde_json::to_value(d).map_err(DecisioningError::from))
        .transpose()
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(
    name = "decisions",
    about = "Append-only decision records with snapshot evidence."
)]
pub struct DecisionsCli {
    #[clap(subcommand)]
    pub command: DecisionsCommand,
}

#[derive(Subcommand, Debug)]
pub enum DecisionsCommand {
    /// Record a decision.
    Record {
        #[clap(long)]
        actor: String,
        #[clap(long)]
        target_type: String,
        #[clap(long)]
        target_id: String,
        /// Verb, e.g. commit, approve, reverse
        #[clap(long)]
        action: String,
        /// Evidence as JSON
        #[clap(long)]
        snapshot: String,
        /// Outcome as JSON
        #[clap(long)]
        outcome: Option<String>,
        #[clap(long)]
        on_behalf_of: Option<String>,
        /// RFC 3339 business time (defaults to now)
        #[clap(long)]
        effective_at: Option<String>,
    },
    /// List decisions.
    List {
        #[clap(long)]
        target_type: Option<String>,
        /// Requires --target-type
        #[clap(long, requires = "target_type")]
        target_id: Option<String>,
        #[clap(long)]
        action: Option<String>,
        #[clap(long)]
        actor: Option<String>,
        /// RFC 3339; only decisions effective at or before this instant
        #[clap(long)]
        as_of: Option<String>,
    },
    /// Show one decision.
    Show {
        #[clap(long)]
        id: String,
    },
    /// Make a decision permanent.
    Finalize {
        #[clap(long)]
        id: String,
        /// Replacement outcome as JSON
        #[clap(long)]
        outcome: Option<String>,
    },
    /// Print JSON schema for the decisions subsystem.
    Schema,
}

pub fn schema() -> JsonValue {
    serde_json::json!({
        "name": "decisions",
        "version": "0.3.0",
        "description": "Append-only decision records with snapshot evidence",
        "commands": [
            { "name": "record", "description": "Record a decision" },
            { "name": "list", "description": "List decisions, optionally as of a time" },
            { "name": "show", "description": "Show one decision" },
            { "name": "finalize", "description": "Make a decision permanent" },
            { "name": "schema", "description": "Print subsystem schema" }
        ],
        "storage": ["decisions"],
        "entity_type": DecisionRecord::TYPE_TAG,
    })
}

fn parse_json_arg(flag: &str, raw: &str) -> Result<JsonValue, DecisioningError> {
    serde_json::from_str(raw)
        .map_err(|e| DecisioningError::ValidationError(format!("--{} is not valid JSON: {}", flag, e)))
}

pub fn run_decisions_cli(store: &Store, cli: DecisionsCli) -> Result<(), DecisioningError> {
    match cli.command {
        DecisionsCommand::Record {
            actor,
            target_type,
            target_id,
            action,
            snapshot,
            outcome,
            on_behalf_of,
            effective_at,
        } => {
            let mut draft = DecisionDraft::new(EntityRef::new(target_type, target_id), &action)
                .actor(&actor)
                .snapshot(parse_json_arg("snapshot", &snapshot)?);
            if let Some(raw) = outcome {
                draft = draft.outcome(parse_json_arg("outcome", &raw)?);
            }
            if let Some(principal) = on_behalf_of {
                draft = draft.on_behalf_of(&principal);
            }
            if let Some(raw) = effective_at {
                draft = draft.effective_at(Timestamp::parse_rfc3339(&raw)?);
            }
            let decision = record_decision(store, &draft)?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }

        DecisionsCommand::List {
            target_type,
            target_id,
            action,
            actor,
            as_of,
        } => {
            let (target, target_type) = match (target_type, target_id) {
                (Some(t), Some(id)) => (Some(EntityRef::new(t, id)), None),
                (t, _) => (None, t),
            };
            let as_of = as_of.as_deref().map(Timestamp::parse_rfc3339).transpose()?;
            let decisions = list_decisions(
                store,
                &DecisionFilter {
                    target,
                    target_type,
                    action,
                    actor,
                    as_of,
                },
            )?;
            if decisions.is_empty() {
                println!("{}", "no decisions".dimmed());
            }
            for d in &decisions {
                let marker = if d.is_final() {
                    "●".bright_green()
                } else {
                    "○".bright_yellow()
                };
                println!(
                    "{} {} {} {} by {} {}",
                    marker,
                    d.id.bold(),
                    d.action.bright_cyan(),
                    d.target,
                    d.actor,
                    preview_json(Some(&d.snapshot), 60).dimmed()
                );
            }
        }

        DecisionsCommand::Show { id } => {
            let decision = get_decision(store, &id)?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }

        DecisionsCommand::Finalize { id, outcome } => {
            let outcome = outcome
                .as_deref()
                .map(|raw| parse_json_arg("outcome", raw))
                .transpose()?;
            let decision = finalize_decision(store, &id, outcome)?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }

        DecisionsCommand::Schema => {
            println!("{}", serde_json::to_string_pretty(&schema())?);
        }
    }
    Ok(())
}
