//! Thread operations on the transcript store.

use rusqlite::{params, Connection, OptionalExtension, Row};

use strand_domain::error::{Error, Result};
use strand_domain::text::{preview, truncate_runes};
use strand_domain::thread::{RunState, ThreadRecord, WaitingPrompt, RUN_ERROR_MAX_RUNES};

use crate::cursor::ThreadCursor;
use crate::db::{db_err, ms_to_dt, now_ms};
use crate::TranscriptStore;

fn row_to_thread(row: &Row<'_>) -> rusqlite::Result<ThreadRecord> {
    let run_status: String = row.get("run_status")?;
    let waiting = match (
        row.get::<_, Option<String>>("waiting_prompt_id")?,
        row.get::<_, Option<String>>("waiting_message_id")?,
        row.get::<_, Option<String>>("waiting_tool_id")?,
    ) {
        (Some(prompt_id), Some(message_id), Some(tool_id)) => Some(WaitingPrompt {
            prompt_id,
            message_id,
            tool_id,
        }),
        _ => None,
    };
    Ok(ThreadRecord {
        endpoint_id: row.get("endpoint_id")?,
        thread_id: row.get("thread_id")?,
        title: row.get("title")?,
        model_id: row.get("model_id")?,
        model_locked: row.get::<_, i64>("model_locked")? != 0,
        working_dir: row.get("working_dir")?,
        run_status: RunState::parse(&run_status).unwrap_or(RunState::Idle),
        run_error: row.get("run_error")?,
        last_message_preview: row.get("last_message_preview")?,
        waiting_prompt: waiting,
        created_at: ms_to_dt(row.get("created_at")?),
        updated_at: ms_to_dt(row.get("updated_at")?),
        last_message_at: row
            .get::<_, Option<i64>>("last_message_at")?
            .map(ms_to_dt),
        run_updated_at: ms_to_dt(row.get("run_updated_at")?),
    })
}

fn get_thread_sync(
    conn: &Connection,
    endpoint_id: &str,
    thread_id: &str,
) -> Result<Option<ThreadRecord>> {
    conn.query_row(
        "SELECT * FROM threads WHERE endpoint_id = ?1 AND thread_id = ?2",
        params![endpoint_id, thread_id],
        row_to_thread,
    )
    .optional()
    .map_err(db_err)
}

impl TranscriptStore {
    /// Create a thread. Fails if the identity already exists.
    pub async fn create_thread(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        title: &str,
        model_id: Option<&str>,
    ) -> Result<ThreadRecord> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        let title = title.to_string();
        let model_id = model_id.map(String::from);
        self.db
            .call(move |conn| {
                let now = now_ms();
                conn.execute(
                    "INSERT INTO threads (endpoint_id, thread_id, title, model_id,
                                          run_status, created_at, updated_at, run_updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'idle', ?5, ?5, ?5)",
                    params![endpoint_id, thread_id, title, model_id, now],
                )
                .map_err(db_err)?;
                get_thread_sync(conn, &endpoint_id, &thread_id)?
                    .ok_or_else(|| Error::Store("thread vanished after insert".into()))
            })
            .await
    }

    pub async fn get_thread(
        &self,
        endpoint_id: &str,
        thread_id: &str,
    ) -> Result<Option<ThreadRecord>> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        self.db
            .call(move |conn| get_thread_sync(conn, &endpoint_id, &thread_id))
            .await
    }

    /// List threads for an endpoint, newest update first, with an opaque
    /// keyset cursor over `(updated_at DESC, thread_id DESC)`.
    pub async fn list_threads(
        &self,
        endpoint_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<ThreadRecord>, Option<String>)> {
        let endpoint_id = endpoint_id.to_string();
        let cursor = match cursor {
            Some(raw) => Some(ThreadCursor::decode(raw)?),
            None => None,
        };
        let limit = limit.clamp(1, 200);
        self.db
            .call(move |conn| {
                let mut threads = Vec::new();
                let mut push = |row: &Row<'_>| -> rusqlite::Result<()> {
                    threads.push(row_to_thread(row)?);
                    Ok(())
                };
                // Fetch one extra row to detect whether a next page exists.
                let fetch = (limit + 1) as i64;
                match &cursor {
                    Some(c) => {
                        let mut stmt = conn
                            .prepare(
                                "SELECT * FROM threads
                                 WHERE endpoint_id = ?1
                                   AND (updated_at < ?2
                                        OR (updated_at = ?2 AND thread_id < ?3))
                                 ORDER BY updated_at DESC, thread_id DESC
                                 LIMIT ?4",
                            )
                            .map_err(db_err)?;
                        let mut rows = stmt
                            .query(params![endpoint_id, c.updated_at_ms, c.thread_id, fetch])
                            .map_err(db_err)?;
                        while let Some(row) = rows.next().map_err(db_err)? {
                            push(row).map_err(db_err)?;
                        }
                    }
                    None => {
                        let mut stmt = conn
                            .prepare(
                                "SELECT * FROM threads
                                 WHERE endpoint_id = ?1
                                 ORDER BY updated_at DESC, thread_id DESC
                                 LIMIT ?2",
                            )
                            .map_err(db_err)?;
                        let mut rows =
                            stmt.query(params![endpoint_id, fetch]).map_err(db_err)?;
                        while let Some(row) = rows.next().map_err(db_err)? {
                            push(row).map_err(db_err)?;
                        }
                    }
                }

                let next = if threads.len() > limit {
                    threads.truncate(limit);
                    threads.last().map(|t| {
                        ThreadCursor {
                            updated_at_ms: t.updated_at.timestamp_millis(),
                            thread_id: t.thread_id.clone(),
                        }
                        .encode()
                    })
                } else {
                    None
                };
                Ok((threads, next))
            })
            .await
    }

    pub async fn rename_thread(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        title: &str,
    ) -> Result<()> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        let title = title.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE threads SET title = ?3, updated_at = ?4
                     WHERE endpoint_id = ?1 AND thread_id = ?2",
                    params![endpoint_id, thread_id, title, now_ms()],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
    }

    /// Update the model id. Deliberately does not touch `updated_at`.
    pub async fn update_thread_model_id(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        model_id: Option<&str>,
    ) -> Result<()> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        let model_id = model_id.map(String::from);
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE threads SET model_id = ?3
                     WHERE endpoint_id = ?1 AND thread_id = ?2",
                    params![endpoint_id, thread_id, model_id],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
    }

    /// Update the working directory after validating it is an absolute path
    /// to an existing directory.
    pub async fn update_thread_working_dir(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        working_dir: &str,
    ) -> Result<()> {
        let path = std::path::Path::new(working_dir);
        if !path.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "working_dir must be absolute: {working_dir}"
            )));
        }
        if !path.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "working_dir does not exist or is not a directory: {working_dir}"
            )));
        }
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        let working_dir = working_dir.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE threads SET working_dir = ?3, updated_at = ?4
                     WHERE endpoint_id = ?1 AND thread_id = ?2",
                    params![endpoint_id, thread_id, working_dir, now_ms()],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
    }

    pub async fn update_thread_model_lock(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        locked: bool,
    ) -> Result<()> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE threads SET model_locked = ?3
                     WHERE endpoint_id = ?1 AND thread_id = ?2",
                    params![endpoint_id, thread_id, locked as i64],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
    }

    /// Update the run state triple. Normalizes per the thread invariants:
    /// error only on failure states (≤ 600 runes), waiting triple only in
    /// `waiting_user`.
    pub async fn update_thread_run_state(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        status: RunState,
        error: &str,
        waiting: Option<WaitingPrompt>,
    ) -> Result<()> {
        let (status, error, waiting) =
            ThreadRecord::normalize_run_state(status, error, waiting);
        debug_assert!(error.chars().count() <= RUN_ERROR_MAX_RUNES);
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        self.db
            .call(move |conn| {
                let now = now_ms();
                let (wp, wm, wt) = match &waiting {
                    Some(w) => (
                        Some(w.prompt_id.as_str()),
                        Some(w.message_id.as_str()),
                        Some(w.tool_id.as_str()),
                    ),
                    None => (None, None, None),
                };
                conn.execute(
                    "UPDATE threads
                     SET run_status = ?3, run_error = ?4,
                         waiting_prompt_id = ?5, waiting_message_id = ?6, waiting_tool_id = ?7,
                         run_updated_at = ?8, updated_at = ?8
                     WHERE endpoint_id = ?1 AND thread_id = ?2",
                    params![
                        endpoint_id,
                        thread_id,
                        status.as_str(),
                        error,
                        wp,
                        wm,
                        wt,
                        now
                    ],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
    }

    /// Overwrite the thread's last-message preview (used at finalization
    /// for synthesized previews like "Canceled.").
    pub async fn update_thread_preview(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        text: &str,
    ) -> Result<()> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        let text = preview(text, 200);
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE threads SET last_message_preview = ?3, last_message_at = ?4
                     WHERE endpoint_id = ?1 AND thread_id = ?2",
                    params![endpoint_id, thread_id, text, now_ms()],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
    }

    /// The thread's current objective ("open goal").
    pub async fn set_thread_open_goal(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        goal: &str,
    ) -> Result<()> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        let goal = truncate_runes(goal, 2_000);
        self.db
            .call(move |conn| {
                conn.execute(
                    "UPDATE threads SET open_goal = ?3
                     WHERE endpoint_id = ?1 AND thread_id = ?2",
                    params![endpoint_id, thread_id, goal],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
    }

    pub async fn get_thread_open_goal(
        &self,
        endpoint_id: &str,
        thread_id: &str,
    ) -> Result<String> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT open_goal FROM threads
                     WHERE endpoint_id = ?1 AND thread_id = ?2",
                    params![endpoint_id, thread_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)
                .map(|g| g.unwrap_or_default())
            })
            .await
    }

    /// Delete a thread and all its dependent rows.
    pub async fn delete_thread(&self, endpoint_id: &str, thread_id: &str) -> Result<()> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        self.db
            .transaction(move |conn| {
                conn.execute(
                    "DELETE FROM run_events WHERE run_id IN
                       (SELECT run_id FROM runs WHERE endpoint_id = ?1 AND thread_id = ?2)",
                    params![endpoint_id, thread_id],
                )
                .map_err(db_err)?;
                conn.execute(
                    "DELETE FROM tool_calls WHERE run_id IN
                       (SELECT run_id FROM runs WHERE endpoint_id = ?1 AND thread_id = ?2)",
                    params![endpoint_id, thread_id],
                )
                .map_err(db_err)?;
                for table in [
                    "runs",
                    "messages",
                    "thread_todos_snapshots",
                ] {
                    conn.execute(
                        &format!(
                            "DELETE FROM {table} WHERE endpoint_id = ?1 AND thread_id = ?2"
                        ),
                        params![endpoint_id, thread_id],
                    )
                    .map_err(db_err)?;
                }
                for table in ["conversation_turns", "execution_spans", "memory_items", "context_snapshots"] {
                    conn.execute(
                        &format!("DELETE FROM {table} WHERE thread_id = ?1"),
                        params![thread_id],
                    )
                    .map_err(db_err)?;
                }
                conn.execute(
                    "DELETE FROM threads WHERE endpoint_id = ?1 AND thread_id = ?2",
                    params![endpoint_id, thread_id],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
    }

    /// Startup recovery: rewrite every non-terminal persisted run state to
    /// `canceled` with an empty error, preserving `waiting_user` byte for
    /// byte. Returns the number of threads rewritten.
    pub async fn recover_run_states(&self) -> Result<usize> {
        self.db
            .call(|conn| {
                let n = conn
                    .execute(
                        "UPDATE threads
                         SET run_status = 'canceled', run_error = '',
                             waiting_prompt_id = NULL, waiting_message_id = NULL,
                             waiting_tool_id = NULL
                         WHERE run_status IN ('accepted', 'running', 'waiting_approval', 'recovering')",
                        [],
                    )
                    .map_err(db_err)?;
                conn.execute(
                    "UPDATE runs SET state = 'canceled'
                     WHERE state IN ('accepted', 'running', 'waiting_approval', 'recovering')",
                    [],
                )
                .map_err(db_err)?;
                Ok(n)
            })
            .await
    }
}
