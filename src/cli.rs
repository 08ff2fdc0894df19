//! CLI struct definitions for the `decisioning` command-line interface.
//!
//! All clap-derived types live here or in the owning plugin. Dispatch lives
//! in `lib.rs`.

use crate::plugins::{decide, idempotency, roles};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "decisioning",
    version = env!("CARGO_PKG_VERSION"),
    about = "Idempotency keys, decision records and effective-dated roles over one SQLite store."
)]
pub(crate) struct Cli {
    /// Store root directory (holds the database, audit log and decisioning.toml)
    #[clap(long, global = true, default_value = ".decisioning")]
    pub root: PathBuf,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug)]
pub(crate) struct AuditCli {
    /// Show only the most recent N events
    #[clap(long)]
    pub limit: Option<usize>,
    /// Only events whose op starts with this prefix (e.g. idempotency.)
    #[clap(long)]
    pub op: Option<String>,
    /// Output format: 'text' or 'json'.
    #[clap(long, default_value = "text")]
    pub format: String,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Inspect and sweep idempotency keys
    Keys(idempotency::KeysCli),
    /// Record, list and finalize decisions
    Decisions(decide::DecisionsCli),
    /// Assign, revoke and query effective-dated roles
    Roles(roles::RolesCli),
    /// Print the broker audit log
    Audit(AuditCli),
    /// Print the effective configuration
    Config,
}
