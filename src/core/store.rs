//! Store handle: one root directory holding the database, the audit log and
//! an optional `decisioning.toml`.

use crate::core::broker::DbBroker;
use crate::core::config::{self, Config};
use crate::core::db;
use crate::core::error::DecisioningError;
use crate::core::time::{Clock, SystemClock, Timestamp};
use rusqlite::Connection;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Cheap to clone; clones share the clock.
#[derive(Clone)]
pub struct Store {
    /// Absolute or caller-relative path to the store root directory
    pub root: PathBuf,
    pub config: Config,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root)
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish()
    }
}

impl Store {
    /// Open (creating if needed) the store at `root`: loads config and
    /// applies the schema.
    pub fn open(root: &Path) -> Result<Self, DecisioningError> {
        let config = config::load_config(root)?;
        Self::open_with_config(root, config)
    }

    pub fn open_with_config(root: &Path, config: Config) -> Result<Self, DecisioningError> {
        fs::create_dir_all(root).map_err(DecisioningError::IoError)?;
        let store = Self {
            root: root.to_path_buf(),
            config,
            clock: Arc::new(SystemClock),
        };
        store
            .broker()
            .with_conn("decisioning", None, "store.init", db::initialize_schema)?;
        Ok(store)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(&self.config.database.file_name)
    }

    pub fn audit_log_path(&self) -> Option<PathBuf> {
        self.config
            .audit
            .enabled
            .then(|| self.root.join(&self.config.audit.file_name))
    }

    pub fn broker(&self) -> DbBroker {
        DbBroker::new(
            &self.db_path(),
            self.config.database.busy_timeout_secs,
            self.audit_log_path(),
        )
    }

    /// Raw connection, bypassing the audit log.
    pub fn connect(&self) -> Result<Connection, DecisioningError> {
        self.broker().connect()
    }
}
