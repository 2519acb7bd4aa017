//! SQL migration definitions for the enrichkit database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: record_state, state_transitions, stack_items, batch_runs, lookup_cache",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Per-record pipeline progress
CREATE TABLE IF NOT EXISTS record_state (
    batch_id      TEXT NOT NULL,
    record_id     TEXT NOT NULL,
    kind          TEXT NOT NULL,
    input_json    TEXT NOT NULL,
    status        TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error    TEXT,
    failure       TEXT,
    payload_json  TEXT,
    version       INTEGER NOT NULL,
    updated_at    TEXT NOT NULL,
    PRIMARY KEY (batch_id, record_id)
);

CREATE INDEX IF NOT EXISTS idx_record_state_status ON record_state(batch_id, status, record_id);

-- Audit log of applied status changes
CREATE TABLE IF NOT EXISTS state_transitions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id      TEXT NOT NULL,
    record_id     TEXT NOT NULL,
    from_status   TEXT,
    to_status     TEXT NOT NULL,
    attempt_count INTEGER NOT NULL,
    version       INTEGER NOT NULL,
    at            TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transitions_record ON state_transitions(batch_id, record_id);

-- Work stack of discovered URLs; rows are never deleted so the table doubles as the seen-set
CREATE TABLE IF NOT EXISTS stack_items (
    stack       TEXT NOT NULL,
    url         TEXT NOT NULL,
    record_id   TEXT NOT NULL,
    batch_id    TEXT NOT NULL,
    email       TEXT,
    seq         INTEGER NOT NULL,
    consumed    INTEGER NOT NULL DEFAULT 0,
    pushed_at   TEXT NOT NULL,
    consumed_at TEXT,
    PRIMARY KEY (stack, url)
);

CREATE INDEX IF NOT EXISTS idx_stack_unconsumed ON stack_items(stack, consumed, seq);

-- Batch run history
CREATE TABLE IF NOT EXISTS batch_runs (
    id          TEXT PRIMARY KEY,
    batch_id    TEXT NOT NULL,
    kind        TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    status      TEXT NOT NULL,
    stats_json  TEXT
);

CREATE INDEX IF NOT EXISTS idx_batch_runs_batch ON batch_runs(batch_id, started_at);

-- Persistent lookup cache
CREATE TABLE IF NOT EXISTS lookup_cache (
    fingerprint TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    value_json  TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    expires_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_lookup_cache_expiry ON lookup_cache(expires_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
