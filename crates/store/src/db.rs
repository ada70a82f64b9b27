//! SQLite connection handling and schema migrations.
//!
//! `rusqlite::Connection` is not `Sync`, so the connection lives behind an
//! `Arc<Mutex<_>>` and every operation runs on the blocking pool via
//! `tokio::task::spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tokio::task::spawn_blocking;

use strand_domain::error::{Error, Result};

/// The schema version this build writes and expects.
pub const SCHEMA_VERSION: i64 = 4;

/// Ordered migration steps. Step `i` migrates from version `i` to `i + 1`.
/// Migrations are additive only: new tables and new columns, never drops.
const MIGRATIONS: &[&str] = &[
    // ── v1: threads + messages ───────────────────────────────────
    r#"
CREATE TABLE threads (
    endpoint_id          TEXT NOT NULL,
    thread_id            TEXT NOT NULL,
    title                TEXT NOT NULL DEFAULT '',
    model_id             TEXT,
    model_locked         INTEGER NOT NULL DEFAULT 0,
    working_dir          TEXT,
    run_status           TEXT NOT NULL DEFAULT 'idle',
    run_error            TEXT NOT NULL DEFAULT '',
    last_message_preview TEXT NOT NULL DEFAULT '',
    waiting_prompt_id    TEXT,
    waiting_message_id   TEXT,
    waiting_tool_id      TEXT,
    created_at           INTEGER NOT NULL,
    updated_at           INTEGER NOT NULL,
    last_message_at      INTEGER,
    run_updated_at       INTEGER NOT NULL,
    PRIMARY KEY (endpoint_id, thread_id)
);

CREATE TABLE messages (
    row_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint_id  TEXT NOT NULL,
    thread_id    TEXT NOT NULL,
    message_id   TEXT NOT NULL UNIQUE,
    role         TEXT NOT NULL,
    status       TEXT NOT NULL,
    text         TEXT NOT NULL DEFAULT '',
    payload_json TEXT NOT NULL DEFAULT '{"blocks":[]}',
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER
);
CREATE INDEX idx_messages_thread ON messages (endpoint_id, thread_id, row_id);
"#,
    // ── v2: runs + tool calls + run events ───────────────────────
    r#"
CREATE TABLE runs (
    run_id               TEXT PRIMARY KEY,
    endpoint_id          TEXT NOT NULL,
    thread_id            TEXT NOT NULL,
    state                TEXT NOT NULL,
    step_count           INTEGER NOT NULL DEFAULT 0,
    budgets_json         TEXT NOT NULL DEFAULT '{}',
    compaction_json      TEXT NOT NULL DEFAULT '{}',
    finalize_reason      TEXT,
    assistant_message_id TEXT,
    intent               TEXT,
    model_id             TEXT,
    input_tokens         INTEGER NOT NULL DEFAULT 0,
    output_tokens        INTEGER NOT NULL DEFAULT 0,
    reasoning_tokens     INTEGER NOT NULL DEFAULT 0,
    estimated_cost_usd   REAL NOT NULL DEFAULT 0,
    input_preview        TEXT NOT NULL DEFAULT '',
    output_preview       TEXT NOT NULL DEFAULT '',
    started_at           INTEGER NOT NULL,
    ended_at             INTEGER
);
CREATE INDEX idx_runs_thread ON runs (endpoint_id, thread_id, started_at);

CREATE TABLE tool_calls (
    run_id        TEXT NOT NULL,
    tool_id       TEXT NOT NULL,
    tool_name     TEXT NOT NULL,
    args_json     TEXT NOT NULL DEFAULT '{}',
    state         TEXT NOT NULL,
    result_json   TEXT,
    error_code    TEXT,
    error_message TEXT,
    started_at    INTEGER NOT NULL,
    ended_at      INTEGER,
    PRIMARY KEY (run_id, tool_id)
);

CREATE TABLE run_events (
    event_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id       TEXT NOT NULL,
    stream       TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    at_unix_ms   INTEGER NOT NULL,
    payload_json TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX idx_run_events_run ON run_events (run_id, event_id);
"#,
    // ── v3: context repository tables + thread open goal ─────────
    r#"
CREATE TABLE conversation_turns (
    turn_id              INTEGER PRIMARY KEY AUTOINCREMENT,
    thread_id            TEXT NOT NULL,
    user_message_id      TEXT NOT NULL,
    assistant_message_id TEXT,
    user_text            TEXT NOT NULL DEFAULT '',
    assistant_text       TEXT NOT NULL DEFAULT '',
    at_unix_ms           INTEGER NOT NULL
);
CREATE INDEX idx_turns_thread ON conversation_turns (thread_id, turn_id);

CREATE TABLE execution_spans (
    span_id      TEXT PRIMARY KEY,
    thread_id    TEXT NOT NULL,
    run_id       TEXT,
    kind         TEXT NOT NULL,
    summary      TEXT NOT NULL,
    payload_json TEXT NOT NULL DEFAULT '{}',
    at_unix_ms   INTEGER NOT NULL
);
CREATE INDEX idx_spans_thread ON execution_spans (thread_id, at_unix_ms);

CREATE TABLE memory_items (
    memory_id        TEXT PRIMARY KEY,
    thread_id        TEXT NOT NULL,
    scope            TEXT NOT NULL,
    kind             TEXT NOT NULL,
    content          TEXT NOT NULL,
    source_refs_json TEXT NOT NULL DEFAULT '[]',
    importance       REAL NOT NULL DEFAULT 0.5,
    freshness        REAL NOT NULL DEFAULT 1.0,
    confidence       REAL NOT NULL DEFAULT 0.5,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL
);
CREATE INDEX idx_memory_thread ON memory_items (thread_id, updated_at);

CREATE TABLE context_snapshots (
    snapshot_id      TEXT PRIMARY KEY,
    thread_id        TEXT NOT NULL,
    level            TEXT NOT NULL,
    summary          TEXT NOT NULL,
    covers_from_turn INTEGER NOT NULL DEFAULT 0,
    covers_to_turn   INTEGER NOT NULL DEFAULT 0,
    quality          REAL NOT NULL DEFAULT 0,
    created_at       INTEGER NOT NULL
);
CREATE INDEX idx_snapshots_thread ON context_snapshots (thread_id, created_at);

ALTER TABLE threads ADD COLUMN open_goal TEXT NOT NULL DEFAULT '';
"#,
    // ── v4: provider capability cache + TODO snapshots ───────────
    r#"
CREATE TABLE provider_capabilities (
    provider_id TEXT NOT NULL,
    model_name  TEXT NOT NULL,
    caps_json   TEXT NOT NULL,
    updated_at  INTEGER NOT NULL,
    PRIMARY KEY (provider_id, model_name)
);

CREATE TABLE thread_todos_snapshots (
    endpoint_id TEXT NOT NULL,
    thread_id   TEXT NOT NULL,
    version     INTEGER NOT NULL,
    todos_json  TEXT NOT NULL DEFAULT '[]',
    updated_at  INTEGER NOT NULL,
    PRIMARY KEY (endpoint_id, thread_id)
);
"#,
];

/// Map a rusqlite error into the shared error type.
pub fn db_err(e: rusqlite::Error) -> Error {
    Error::Store(e.to_string())
}

/// Async-safe SQLite handle. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| {
                tracing::warn!("sqlite mutex poisoned, recovering");
                poisoned.into_inner()
            });
            f(&guard)
        })
        .await
        .map_err(|e| Error::Store(format!("spawn_blocking failed: {e}")))?
    }

    /// Run `f` inside a transaction on the blocking pool.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| {
                tracing::warn!("sqlite mutex poisoned in transaction, recovering");
                poisoned.into_inner()
            });
            let tx = guard.transaction().map_err(db_err)?;
            let result = f(&tx)?;
            tx.commit().map_err(db_err)?;
            Ok(result)
        })
        .await
        .map_err(|e| Error::Store(format!("spawn_blocking failed: {e}")))?
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version    INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );",
    )
    .map_err(db_err)?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(db_err)?;

    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let target = idx as i64 + 1;
        if target <= current {
            continue;
        }
        conn.execute_batch(&format!("BEGIN;\n{sql}\nCOMMIT;"))
            .map_err(|e| Error::Store(format!("migration to v{target} failed: {e}")))?;
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, strftime('%s','now') * 1000)",
            [target],
        )
        .map_err(db_err)?;
        tracing::info!(version = target, "applied schema migration");
    }

    Ok(())
}

/// Current unix time in milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Millisecond timestamp → UTC datetime (best effort, clamped at range).
pub(crate) fn ms_to_dt(ms: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_in_order() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let versions: Vec<i64> = conn
            .prepare("SELECT version FROM schema_version ORDER BY version")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(versions, vec![1, 2, 3, 4]);
    }

    #[test]
    fn migrate_twice_is_noop() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, SCHEMA_VERSION);
    }

    #[test]
    fn all_required_tables_exist() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        for table in [
            "threads",
            "messages",
            "runs",
            "tool_calls",
            "run_events",
            "conversation_turns",
            "execution_spans",
            "memory_items",
            "context_snapshots",
            "provider_capabilities",
            "thread_todos_snapshots",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
