//! Centralized database schema definitions.
//!
//! One SQLite file per store holds three tables:
//! 1. idempotency_keys: (scope, key) state machine and cached results.
//! 2. decisions: append-only decision records with snapshot evidence.
//! 3. role_assignments: effective-dated subject/role links.
//!
//! All timestamps are INTEGER microseconds since the Unix epoch.

pub const IDEMPOTENCY_DB_SCHEMA_KEYS: &str = "
    CREATE TABLE IF NOT EXISTS idempotency_keys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scope TEXT NOT NULL,
        key TEXT NOT NULL,
        request_hash TEXT NOT NULL DEFAULT '',
        state TEXT NOT NULL DEFAULT 'pending'
            CHECK (state IN ('pending', 'processing', 'succeeded', 'failed')),
        locked_at INTEGER,
        error_code TEXT NOT NULL DEFAULT '',
        error_message TEXT NOT NULL DEFAULT '',
        response_snapshot TEXT, -- JSON
        result_type TEXT,
        result_id TEXT NOT NULL DEFAULT '',
        created_at INTEGER NOT NULL,
        expires_at INTEGER,
        UNIQUE (scope, key)
    );
    CREATE INDEX IF NOT EXISTS idx_idempotency_keys_expires ON idempotency_keys(expires_at);
    CREATE INDEX IF NOT EXISTS idx_idempotency_keys_state ON idempotency_keys(state);
    CREATE INDEX IF NOT EXISTS idx_idempotency_keys_created ON idempotency_keys(created_at);
";

pub const DECIDE_DB_SCHEMA_DECISIONS: &str = "
    CREATE TABLE IF NOT EXISTS decisions (
        id TEXT PRIMARY KEY,
        effective_at INTEGER NOT NULL,
        recorded_at INTEGER NOT NULL,
        actor TEXT NOT NULL CHECK (actor <> ''),
        on_behalf_of TEXT,
        authority_context TEXT NOT NULL DEFAULT '{}', -- JSON
        target_type TEXT NOT NULL,
        target_id TEXT NOT NULL,
        action TEXT NOT NULL,
        snapshot TEXT NOT NULL, -- JSON
        outcome TEXT NOT NULL DEFAULT '{}', -- JSON
        finalized_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_decisions_target ON decisions(target_type, target_id);
    CREATE INDEX IF NOT EXISTS idx_decisions_actor ON decisions(actor);
    CREATE INDEX IF NOT EXISTS idx_decisions_action ON decisions(action);
    CREATE INDEX IF NOT EXISTS idx_decisions_effective ON decisions(effective_at);
";

/// Write-once guards. Only `outcome` and `finalized_at` may change, once.
pub const DECIDE_DB_SCHEMA_TRIGGERS: &str = "
    CREATE TRIGGER IF NOT EXISTS decisions_evidence_immutable
    BEFORE UPDATE OF effective_at, recorded_at, actor, on_behalf_of, authority_context,
                     target_type, target_id, action, snapshot
    ON decisions
    BEGIN
        SELECT RAISE(ABORT, 'decision evidence is immutable');
    END;
    CREATE TRIGGER IF NOT EXISTS decisions_final_is_permanent
    BEFORE UPDATE ON decisions
    WHEN OLD.finalized_at IS NOT NULL
    BEGIN
        SELECT RAISE(ABORT, 'decision is final');
    END;
    CREATE TRIGGER IF NOT EXISTS decisions_append_only
    BEFORE DELETE ON decisions
    BEGIN
        SELECT RAISE(ABORT, 'decisions are append-only');
    END;
";

pub const ROLES_DB_SCHEMA_ASSIGNMENTS: &str = "
    CREATE TABLE IF NOT EXISTS role_assignments (
        id TEXT PRIMARY KEY,
        subject TEXT NOT NULL,
        role TEXT NOT NULL,
        assigned_by TEXT,
        assigned_at INTEGER NOT NULL,
        is_primary INTEGER NOT NULL DEFAULT 0,
        valid_from INTEGER NOT NULL,
        valid_to INTEGER,
        CHECK (valid_to IS NULL OR valid_to > valid_from)
    );
    CREATE INDEX IF NOT EXISTS idx_role_assignments_subject ON role_assignments(subject);
    CREATE INDEX IF NOT EXISTS idx_role_assignments_valid_from ON role_assignments(valid_from);
    CREATE INDEX IF NOT EXISTS idx_role_assignments_valid_to ON role_assignments(valid_to);
";

pub fn all_schemas() -> [&'static str; 4] {
    [
        IDEMPOTENCY_DB_SCHEMA_KEYS,
        DECIDE_DB_SCHEMA_DECISIONS,
        DECIDE_DB_SCHEMA_TRIGGERS,
        ROLES_DB_SCHEMA_ASSIGNMENTS,
    ]
}
