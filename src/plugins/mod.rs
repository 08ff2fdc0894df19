//! Subsystems built on [`crate::core`].
//!
//! - `idempotency`: the (scope, key) state machine and its retention sweep
//! - `idempotent`: the call wrapper that executes once and replays after
//! - `decide`: append-only decision records with snapshot evidence
//! - `roles`: effective-dated role assignments

pub mod decide;
pub mod idempotency;
pub mod idempotent;
pub mod roles;
