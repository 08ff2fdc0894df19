//! Decisioning: idempotent operations, decision audit and effective dating.
//!
//! **One SQLite store, three kinds of state, every write audited.**
//!
//! # Core Principles
//!
//! - **At most one success per key**: an operation wrapped in
//!   [`plugins::idempotent::Idempotent`] succeeds once per `(scope, key)`;
//!   retries replay the stored result, failures stay retriable
//! - **Evidence is write-once**: decision records are append-only and their
//!   evidence columns are frozen by database triggers
//! - **Time is explicit**: interval rows answer "valid as of T" with an
//!   inclusive start and an exclusive end; point events answer
//!   "effective at or before T"
//!
//! # Architecture
//!
//! ## The Thin Waist
//!
//! All state access routes through `DbBroker` for:
//! - Fresh connections with WAL and a busy timeout
//! - Immediate (write-locked) transactions
//! - Audit logging (`broker.events.jsonl`)
//!
//! ## Subsystems (Plugins)
//!
//! - `idempotency`: the (scope, key) state machine and retention sweep
//! - `idempotent`: the call wrapper
//! - `decide`: decision records
//! - `roles`: effective-dated role assignments
//!
//! # Examples
//!
//! ```bash
//! decisioning keys list --state failed
//! decisioning keys cleanup --days 7 --dry-run
//! decisioning decisions list --target-type basket --target-id B-17 --as-of 2026-01-01T00:00:00Z
//! decisioning roles list --subject ana --as-of 2025-06-01T00:00:00Z
//! decisioning audit --limit 20
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: store, broker, schemas, time, config, registry, as-of queries
//! - [`plugins`]: subsystem implementations

pub mod core;
pub mod plugins;

mod cli;

use crate::cli::{AuditCli, Cli, Command};
use crate::core::broker::{BrokerEvent, read_audit_log};
use crate::core::error;
use crate::core::output::compact_line;
use crate::core::store::Store;
use crate::core::time::command_envelope;
use crate::plugins::{decide, idempotency, roles};
use clap::Parser;
use colored::Colorize;

pub fn run() -> Result<(), error::DecisioningError> {
    let cli = Cli::parse();
    let store = Store::open(&cli.root)?;

    match cli.command {
        Command::Keys(keys_cli) => idempotency::run_keys_cli(&store, keys_cli)?,
        Command::Decisions(decisions_cli) => decide::run_decisions_cli(&store, decisions_cli)?,
        Command::Roles(roles_cli) => roles::run_roles_cli(&store, roles_cli)?,
        Command::Audit(audit_cli) => run_audit(&store, audit_cli)?,
        Command::Config => {
            let rendered = toml::to_string_pretty(&store.config)
                .map_err(|e| error::DecisioningError::ConfigFileError(e.to_string()))?;
            println!("{}", rendered);
        }
    }

    Ok(())
}

fn run_audit(store: &Store, cli: AuditCli) -> Result<(), error::DecisioningError> {
    let Some(path) = store.audit_log_path() else {
        println!("{}", "audit log disabled ([audit].enabled = false)".yellow());
        return Ok(());
    };
    let mut events: Vec<BrokerEvent> = read_audit_log(&path)?;
    if let Some(prefix) = &cli.op {
        events.retain(|e| e.op.starts_with(prefix.as_str()));
    }
    if let Some(limit) = cli.limit {
        let skip = events.len().saturating_sub(limit);
        events.drain(..skip);
    }

    if cli.format == "json" {
        let envelope = command_envelope(
            "audit",
            "ok",
            serde_json::json!({ "count": events.len(), "events": events }),
        );
        println!("{}", serde_json::to_string_pretty(&envelope)?);
        return Ok(());
    }

    for ev in &events {
        let status = if ev.status == "success" {
            ev.status.bright_green()
        } else {
            ev.status.bright_red()
        };
        println!(
            "{} {} {} {} {}",
            ev.ts.dimmed(),
            ev.op.bright_cyan(),
            status,
            ev.actor,
            compact_line(ev.intent_ref.as_deref().unwrap_or(""), 60)
        );
    }
    Ok(())
}
