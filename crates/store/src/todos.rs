//! Thread TODO snapshot with optimistic concurrency.
//!
//! The snapshot is one row per thread carrying a version counter. A write
//! with `expected_version` fails with the `ThreadTodosVersionConflict`
//! sentinel when the stored version differs; the winner's version is
//! always `prior + 1`.

use rusqlite::{params, OptionalExtension};

use strand_domain::context::TodosSnapshot;
use strand_domain::error::{Error, Result};

use crate::db::{db_err, now_ms};
use crate::TranscriptStore;

impl TranscriptStore {
    /// Current snapshot; `{version: 0, todos_json: "[]"}` when absent.
    pub async fn get_thread_todos_snapshot(
        &self,
        endpoint_id: &str,
        thread_id: &str,
    ) -> Result<TodosSnapshot> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        self.db
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT version, todos_json FROM thread_todos_snapshots
                         WHERE endpoint_id = ?1 AND thread_id = ?2",
                        params![endpoint_id, thread_id],
                        |row| {
                            Ok(TodosSnapshot {
                                version: row.get::<_, i64>(0)? as u64,
                                todos_json: row.get(1)?,
                            })
                        },
                    )
                    .optional()
                    .map_err(db_err)?;
                Ok(row.unwrap_or_else(TodosSnapshot::empty))
            })
            .await
    }

    /// Replace the snapshot. When `expected_version` is `Some` and does not
    /// match the stored version, fails with the version-conflict sentinel
    /// without writing. Returns the installed snapshot.
    pub async fn replace_thread_todos_snapshot(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        todos_json: &str,
        expected_version: Option<u64>,
    ) -> Result<TodosSnapshot> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        let todos_json = todos_json.to_string();
        self.db
            .transaction(move |conn| {
                let current: u64 = conn
                    .query_row(
                        "SELECT version FROM thread_todos_snapshots
                         WHERE endpoint_id = ?1 AND thread_id = ?2",
                        params![endpoint_id, thread_id],
                        |row| row.get::<_, i64>(0),
                    )
                    .optional()
                    .map_err(db_err)?
                    .unwrap_or(0) as u64;

                if let Some(expected) = expected_version {
                    if expected != current {
                        return Err(Error::ThreadTodosVersionConflict {
                            expected,
                            current,
                        });
                    }
                }

                let next = current + 1;
                conn.execute(
                    "INSERT INTO thread_todos_snapshots
                        (endpoint_id, thread_id, version, todos_json, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (endpoint_id, thread_id) DO UPDATE SET
                        version = excluded.version,
                        todos_json = excluded.todos_json,
                        updated_at = excluded.updated_at",
                    params![endpoint_id, thread_id, next as i64, todos_json, now_ms()],
                )
                .map_err(db_err)?;

                Ok(TodosSnapshot {
                    version: next,
                    todos_json,
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> TranscriptStore {
        let s = TranscriptStore::open_in_memory().unwrap();
        s.create_thread("ep", "th1", "t", None).await.unwrap();
        s
    }

    #[tokio::test]
    async fn absent_snapshot_is_version_zero() {
        let s = store().await;
        let snap = s.get_thread_todos_snapshot("ep", "th1").await.unwrap();
        assert_eq!(snap.version, 0);
        assert_eq!(snap.todos_json, "[]");
    }

    #[tokio::test]
    async fn versions_increment() {
        let s = store().await;
        let v1 = s
            .replace_thread_todos_snapshot("ep", "th1", r#"[{"id":"todo_1","content":"a"}]"#, None)
            .await
            .unwrap();
        assert_eq!(v1.version, 1);
        let v2 = s
            .replace_thread_todos_snapshot("ep", "th1", "[]", Some(1))
            .await
            .unwrap();
        assert_eq!(v2.version, 2);
    }

    #[tokio::test]
    async fn mismatched_expected_version_conflicts_without_writing() {
        let s = store().await;
        s.replace_thread_todos_snapshot("ep", "th1", r#"["keep"]"#, None)
            .await
            .unwrap();
        let err = s
            .replace_thread_todos_snapshot("ep", "th1", r#"["clobber"]"#, Some(7))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ThreadTodosVersionConflict {
                expected: 7,
                current: 1
            }
        ));
        let snap = s.get_thread_todos_snapshot("ep", "th1").await.unwrap();
        assert_eq!(snap.todos_json, r#"["keep"]"#);
    }

    #[tokio::test]
    async fn concurrent_writers_one_wins() {
        let s = store().await;
        s.replace_thread_todos_snapshot("ep", "th1", "[]", None)
            .await
            .unwrap();

        // Two writers race with the same expected_version = 1.
        let a = s.replace_thread_todos_snapshot("ep", "th1", r#"["a"]"#, Some(1));
        let b = s.replace_thread_todos_snapshot("ep", "th1", r#"["b"]"#, Some(1));
        let (ra, rb) = tokio::join!(a, b);

        let oks = [ra.is_ok(), rb.is_ok()];
        assert_eq!(oks.iter().filter(|ok| **ok).count(), 1, "exactly one winner");
        let winner = if let Ok(w) = ra { w } else { rb.unwrap() };
        assert_eq!(winner.version, 2);
    }
}
