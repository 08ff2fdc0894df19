//! Core modules shared by every decisioning subsystem.
//!
//! Storage access, the audit log, time, configuration, entity references and
//! the as-of query layer live here. Subsystems in [`crate::plugins`] build on
//! these and never open SQLite on their own.

pub mod asof;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod output;
pub mod registry;
pub mod schemas;
pub mod store;
pub mod time;
