//! Context repository — dialogue turns, execution evidence, memory items,
//! context snapshots, and the provider capability cache.
//!
//! Backed by the same database as the transcript store; the repository
//! only adds read shapes and bounded-write normalization on top.

use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};

use strand_domain::capability::ProviderCapability;
use strand_domain::context::{
    ContextSnapshot, ConversationTurn, ExecutionSpan, MemoryItem, MemoryKind, MemoryScope,
    SnapshotLevel, TodoStatus, TodosSnapshot,
};
use strand_domain::error::Result;
use strand_domain::message::Role;
use strand_domain::text::truncate_runes_with;

use crate::db::{db_err, ms_to_dt, now_ms};
use crate::messages::row_to_message;
use crate::ContextRepo;

/// Bound for execution-span summaries, in runes.
pub const SPAN_SUMMARY_MAX_RUNES: usize = 220;
/// Bound for execution-span payload JSON, in runes.
pub const SPAN_PAYLOAD_MAX_RUNES: usize = 400;
/// Marker appended when a span field was compacted to fit its bound.
pub const COMPRESSED_MARKER: &str = "[compressed]";

fn row_to_turn(row: &Row<'_>) -> rusqlite::Result<ConversationTurn> {
    Ok(ConversationTurn {
        thread_id: row.get("thread_id")?,
        user_message_id: row.get("user_message_id")?,
        assistant_message_id: row.get("assistant_message_id")?,
        user_text: row.get("user_text")?,
        assistant_text: row.get("assistant_text")?,
        at: ms_to_dt(row.get("at_unix_ms")?),
    })
}

fn row_to_span(row: &Row<'_>) -> rusqlite::Result<ExecutionSpan> {
    Ok(ExecutionSpan {
        span_id: row.get("span_id")?,
        thread_id: row.get("thread_id")?,
        run_id: row.get("run_id")?,
        kind: row.get("kind")?,
        summary: row.get("summary")?,
        payload_json: row.get("payload_json")?,
        at: ms_to_dt(row.get("at_unix_ms")?),
    })
}

fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<MemoryItem> {
    let scope: String = row.get("scope")?;
    let kind: String = row.get("kind")?;
    let refs: String = row.get("source_refs_json")?;
    Ok(MemoryItem {
        memory_id: row.get("memory_id")?,
        thread_id: row.get("thread_id")?,
        scope: MemoryScope::parse(&scope).unwrap_or(MemoryScope::Working),
        kind: MemoryKind::parse(&kind).unwrap_or(MemoryKind::Fact),
        content: row.get("content")?,
        source_refs: serde_json::from_str(&refs).unwrap_or_default(),
        importance: row.get("importance")?,
        freshness: row.get("freshness")?,
        confidence: row.get("confidence")?,
        created_at: ms_to_dt(row.get("created_at")?),
        updated_at: ms_to_dt(row.get("updated_at")?),
    })
}

impl ContextRepo {
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Dialogue turns
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Record a completed (or pending) turn.
    pub async fn append_conversation_turn(&self, turn: &ConversationTurn) -> Result<()> {
        let turn = turn.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO conversation_turns
                        (thread_id, user_message_id, assistant_message_id,
                         user_text, assistant_text, at_unix_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        turn.thread_id,
                        turn.user_message_id,
                        turn.assistant_message_id,
                        turn.user_text,
                        turn.assistant_text,
                        turn.at.timestamp_millis(),
                    ],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
    }

    /// The last `limit` dialogue turns in chronological order.
    ///
    /// When the turn table has no rows for the thread, falls back to
    /// pairing user/assistant transcript messages in append order. Each
    /// assistant message pairs with the most recent unpaired user message;
    /// user messages left unpaired (orphans) are emitted as pending turns
    /// at their chronological position, never dropped.
    pub async fn list_recent_dialogue_turns(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        let limit = limit.clamp(1, 500);
        self.db
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT * FROM (
                             SELECT * FROM conversation_turns
                             WHERE thread_id = ?1
                             ORDER BY turn_id DESC LIMIT ?2
                         ) ORDER BY turn_id ASC",
                    )
                    .map_err(db_err)?;
                let mut rows = stmt
                    .query(params![thread_id, limit as i64])
                    .map_err(db_err)?;
                let mut turns = Vec::new();
                while let Some(row) = rows.next().map_err(db_err)? {
                    turns.push(row_to_turn(row).map_err(db_err)?);
                }
                if !turns.is_empty() {
                    return Ok(turns);
                }

                // Fallback: reconstruct turns from the transcript.
                let mut stmt = conn
                    .prepare(
                        "SELECT * FROM messages
                         WHERE endpoint_id = ?1 AND thread_id = ?2
                         ORDER BY row_id ASC",
                    )
                    .map_err(db_err)?;
                let mut rows = stmt
                    .query(params![endpoint_id, thread_id])
                    .map_err(db_err)?;
                let mut reconstructed: Vec<ConversationTurn> = Vec::new();
                while let Some(row) = rows.next().map_err(db_err)? {
                    let msg = row_to_message(row).map_err(db_err)?;
                    match msg.role {
                        Role::User => reconstructed.push(ConversationTurn {
                            thread_id: msg.thread_id.clone(),
                            user_message_id: msg.message_id.clone(),
                            assistant_message_id: None,
                            user_text: msg.text.clone(),
                            assistant_text: String::new(),
                            at: msg.created_at,
                        }),
                        Role::Assistant => {
                            if let Some(open) = reconstructed
                                .iter_mut()
                                .rev()
                                .find(|t| t.assistant_message_id.is_none())
                            {
                                open.assistant_message_id = Some(msg.message_id.clone());
                                open.assistant_text = msg.text.clone();
                            }
                        }
                        Role::Tool => {}
                    }
                }
                let skip = reconstructed.len().saturating_sub(limit);
                Ok(reconstructed.split_off(skip))
            })
            .await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Execution evidence
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Upsert one span. Over-long summary/payload inputs are compacted to
    /// their rune bounds with a trailing `[compressed]` marker; the span id
    /// is always preserved.
    pub async fn upsert_execution_span(&self, span: &ExecutionSpan) -> Result<()> {
        let mut span = span.clone();
        span.summary =
            truncate_runes_with(&span.summary, SPAN_SUMMARY_MAX_RUNES, COMPRESSED_MARKER);
        span.payload_json = truncate_runes_with(
            &span.payload_json,
            SPAN_PAYLOAD_MAX_RUNES,
            COMPRESSED_MARKER,
        );
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO execution_spans
                        (span_id, thread_id, run_id, kind, summary, payload_json, at_unix_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT (span_id) DO UPDATE SET
                        kind = excluded.kind,
                        summary = excluded.summary,
                        payload_json = excluded.payload_json,
                        at_unix_ms = excluded.at_unix_ms",
                    params![
                        span.span_id,
                        span.thread_id,
                        span.run_id,
                        span.kind,
                        span.summary,
                        span.payload_json,
                        span.at.timestamp_millis(),
                    ],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
    }

    /// Recent spans for a thread (newest last). Pass `run_id` to narrow to
    /// one run.
    pub async fn list_recent_execution_spans(
        &self,
        thread_id: &str,
        run_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionSpan>> {
        let thread_id = thread_id.to_string();
        let run_id = run_id.map(String::from);
        let limit = limit.clamp(1, 500) as i64;
        self.db
            .call(move |conn| {
                let mut out = Vec::new();
                let sql = match run_id {
                    Some(_) => {
                        "SELECT * FROM (
                             SELECT *, rowid AS rid FROM execution_spans
                             WHERE thread_id = ?1 AND run_id = ?3
                             ORDER BY at_unix_ms DESC, rid DESC LIMIT ?2
                         ) ORDER BY at_unix_ms ASC, rid ASC"
                    }
                    None => {
                        "SELECT * FROM (
                             SELECT *, rowid AS rid FROM execution_spans
                             WHERE thread_id = ?1
                             ORDER BY at_unix_ms DESC, rid DESC LIMIT ?2
                         ) ORDER BY at_unix_ms ASC, rid ASC"
                    }
                };
                let mut stmt = conn.prepare(sql).map_err(db_err)?;
                let mut rows = match &run_id {
                    Some(rid) => stmt
                        .query(params![thread_id, limit, rid])
                        .map_err(db_err)?,
                    None => stmt.query(params![thread_id, limit]).map_err(db_err)?,
                };
                while let Some(row) = rows.next().map_err(db_err)? {
                    out.push(row_to_span(row).map_err(db_err)?);
                }
                Ok(out)
            })
            .await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Memory items
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn upsert_memory_item(&self, item: &MemoryItem) -> Result<()> {
        let item = item.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO memory_items
                        (memory_id, thread_id, scope, kind, content, source_refs_json,
                         importance, freshness, confidence, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT (memory_id) DO UPDATE SET
                        scope = excluded.scope,
                        kind = excluded.kind,
                        content = excluded.content,
                        source_refs_json = excluded.source_refs_json,
                        importance = excluded.importance,
                        freshness = excluded.freshness,
                        confidence = excluded.confidence,
                        updated_at = excluded.updated_at",
                    params![
                        item.memory_id,
                        item.thread_id,
                        item.scope.as_str(),
                        item.kind.as_str(),
                        item.content,
                        serde_json::to_string(&item.source_refs)?,
                        item.importance,
                        item.freshness,
                        item.confidence,
                        item.created_at.timestamp_millis(),
                        item.updated_at.timestamp_millis(),
                    ],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
    }

    pub async fn list_recent_memory_items(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        self.query_memory(thread_id, None, limit).await
    }

    /// Blockers are memory items of kind `blocker`.
    pub async fn list_blockers(&self, thread_id: &str, limit: usize) -> Result<Vec<MemoryItem>> {
        self.query_memory(thread_id, Some(MemoryKind::Blocker), limit).await
    }

    async fn query_memory(
        &self,
        thread_id: &str,
        kind: Option<MemoryKind>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        let thread_id = thread_id.to_string();
        let limit = limit.clamp(1, 500) as i64;
        self.db
            .call(move |conn| {
                let sql = match kind {
                    Some(_) => {
                        "SELECT * FROM memory_items
                         WHERE thread_id = ?1 AND kind = ?3
                         ORDER BY updated_at DESC, rowid DESC LIMIT ?2"
                    }
                    None => {
                        "SELECT * FROM memory_items
                         WHERE thread_id = ?1
                         ORDER BY updated_at DESC, rowid DESC LIMIT ?2"
                    }
                };
                let mut stmt = conn.prepare(sql).map_err(db_err)?;
                let mut rows = match kind {
                    Some(k) => stmt
                        .query(params![thread_id, limit, k.as_str()])
                        .map_err(db_err)?,
                    None => stmt.query(params![thread_id, limit]).map_err(db_err)?,
                };
                let mut out = Vec::new();
                while let Some(row) = rows.next().map_err(db_err)? {
                    out.push(row_to_memory(row).map_err(db_err)?);
                }
                Ok(out)
            })
            .await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Pending todos
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Pending TODO lines synthesized from the thread snapshot. In-progress
    /// items carry an `[in_progress]` prefix; notes follow in parentheses.
    pub async fn thread_pending_todos(
        &self,
        endpoint_id: &str,
        thread_id: &str,
    ) -> Result<Vec<String>> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        let snapshot = self
            .db
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
            .await?;

        let mut lines = Vec::new();
        for item in snapshot.items() {
            if item.status == TodoStatus::Done {
                continue;
            }
            let mut line = String::new();
            if item.status == TodoStatus::InProgress {
                line.push_str("[in_progress] ");
            }
            line.push_str(&item.content);
            if let Some(note) = &item.note {
                if !note.is_empty() {
                    line.push_str(&format!(" ({note})"));
                }
            }
            lines.push(line);
        }
        Ok(lines)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Context snapshots
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Persist a snapshot. The id is a content hash, so re-saving an
    /// identical summary is a no-op upsert.
    pub async fn save_context_snapshot(
        &self,
        thread_id: &str,
        level: SnapshotLevel,
        summary: &str,
        covers_from_turn: i64,
        covers_to_turn: i64,
        quality: f64,
    ) -> Result<ContextSnapshot> {
        let snapshot = ContextSnapshot {
            snapshot_id: snapshot_content_id(thread_id, level, summary),
            thread_id: thread_id.to_string(),
            level,
            summary: summary.to_string(),
            covers_from_turn,
            covers_to_turn,
            quality,
            created_at: ms_to_dt(now_ms()),
        };
        let stored = snapshot.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO context_snapshots
                        (snapshot_id, thread_id, level, summary,
                         covers_from_turn, covers_to_turn, quality, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT (snapshot_id) DO UPDATE SET
                        covers_from_turn = excluded.covers_from_turn,
                        covers_to_turn = excluded.covers_to_turn,
                        quality = excluded.quality",
                    params![
                        stored.snapshot_id,
                        stored.thread_id,
                        stored.level.as_str(),
                        stored.summary,
                        stored.covers_from_turn,
                        stored.covers_to_turn,
                        stored.quality,
                        stored.created_at.timestamp_millis(),
                    ],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await?;
        Ok(snapshot)
    }

    /// Latest snapshot for a thread at the given level, if any.
    pub async fn latest_context_snapshot(
        &self,
        thread_id: &str,
        level: SnapshotLevel,
    ) -> Result<Option<ContextSnapshot>> {
        let thread_id = thread_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT * FROM context_snapshots
                     WHERE thread_id = ?1 AND level = ?2
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    params![thread_id, level.as_str()],
                    |row| {
                        let lvl: String = row.get("level")?;
                        Ok(ContextSnapshot {
                            snapshot_id: row.get("snapshot_id")?,
                            thread_id: row.get("thread_id")?,
                            level: SnapshotLevel::parse(&lvl)
                                .unwrap_or(SnapshotLevel::Episode),
                            summary: row.get("summary")?,
                            covers_from_turn: row.get("covers_from_turn")?,
                            covers_to_turn: row.get("covers_to_turn")?,
                            quality: row.get("quality")?,
                            created_at: ms_to_dt(row.get("created_at")?),
                        })
                    },
                )
                .optional()
                .map_err(db_err)
            })
            .await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Provider capability cache
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn put_provider_capability(&self, cap: &ProviderCapability) -> Result<()> {
        let cap = cap.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO provider_capabilities
                        (provider_id, model_name, caps_json, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (provider_id, model_name) DO UPDATE SET
                        caps_json = excluded.caps_json,
                        updated_at = excluded.updated_at",
                    params![
                        cap.provider_id,
                        cap.model_name,
                        serde_json::to_string(&cap)?,
                        now_ms(),
                    ],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
    }

    pub async fn get_provider_capability(
        &self,
        provider_id: &str,
        model_name: &str,
    ) -> Result<Option<ProviderCapability>> {
        let provider_id = provider_id.to_string();
        let model_name = model_name.to_string();
        self.db
            .call(move |conn| {
                let raw: Option<String> = conn
                    .query_row(
                        "SELECT caps_json FROM provider_capabilities
                         WHERE provider_id = ?1 AND model_name = ?2",
                        params![provider_id, model_name],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db_err)?;
                Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
            })
            .await
    }
}

/// Content-hash id for a snapshot: sha256 over thread, level, and summary.
fn snapshot_content_id(thread_id: &str, level: SnapshotLevel, summary: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(thread_id.as_bytes());
    hasher.update([0]);
    hasher.update(level.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(summary.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use strand_domain::message::{MessagePayload, MessageStatus};
    use strand_domain::message::Role;
    use crate::TranscriptStore;

    async fn fixtures() -> (TranscriptStore, ContextRepo) {
        let s = TranscriptStore::open_in_memory().unwrap();
        s.create_thread("ep", "th1", "t", None).await.unwrap();
        let repo = s.context_repo();
        (s, repo)
    }

    async fn say(s: &TranscriptStore, id: &str, role: Role, text: &str) {
        s.append_message(
            "ep",
            "th1",
            id,
            role,
            MessageStatus::Complete,
            &MessagePayload::text_only(text),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn stored_turns_win_over_fallback() {
        let (_s, repo) = fixtures().await;
        repo.append_conversation_turn(&ConversationTurn {
            thread_id: "th1".into(),
            user_message_id: "u1".into(),
            assistant_message_id: Some("a1".into()),
            user_text: "hi".into(),
            assistant_text: "hello".into(),
            at: Utc::now(),
        })
        .await
        .unwrap();
        let turns = repo.list_recent_dialogue_turns("ep", "th1", 10).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].user_message_id, "u1");
    }

    #[tokio::test]
    async fn fallback_pairs_messages_and_emits_pending_tail() {
        let (s, repo) = fixtures().await;
        say(&s, "u1", Role::User, "question one").await;
        say(&s, "a1", Role::Assistant, "answer one").await;
        say(&s, "u2", Role::User, "question two").await;

        let turns = repo.list_recent_dialogue_turns("ep", "th1", 10).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].assistant_message_id.as_deref(), Some("a1"));
        assert!(turns[1].is_pending());
        assert_eq!(turns[1].user_text, "question two");
    }

    #[tokio::test]
    async fn orphan_pattern_preserves_all_users_in_order() {
        let (s, repo) = fixtures().await;
        // Orphan user, then a paired pair, then another orphan.
        say(&s, "u1", Role::User, "orphan one").await;
        say(&s, "u2", Role::User, "paired").await;
        say(&s, "a1", Role::Assistant, "reply to paired").await;
        say(&s, "u3", Role::User, "orphan two").await;

        let turns = repo.list_recent_dialogue_turns("ep", "th1", 10).await.unwrap();
        let users: Vec<_> = turns.iter().map(|t| t.user_text.as_str()).collect();
        assert_eq!(users, vec!["orphan one", "paired", "orphan two"]);
        assert!(turns[0].is_pending());
        assert_eq!(turns[1].assistant_message_id.as_deref(), Some("a1"));
        assert!(turns[2].is_pending());
    }

    #[tokio::test]
    async fn span_fields_are_compacted_with_marker() {
        let (_s, repo) = fixtures().await;
        let span = ExecutionSpan {
            span_id: "sp1".into(),
            thread_id: "th1".into(),
            run_id: None,
            kind: "tool".into(),
            summary: "s".repeat(500),
            payload_json: "p".repeat(900),
            at: Utc::now(),
        };
        repo.upsert_execution_span(&span).await.unwrap();
        let spans = repo.list_recent_execution_spans("th1", None, 10).await.unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].span_id, "sp1");
        assert!(spans[0].summary.ends_with(COMPRESSED_MARKER));
        assert_eq!(
            spans[0].summary.chars().count(),
            SPAN_SUMMARY_MAX_RUNES + COMPRESSED_MARKER.chars().count()
        );
        assert!(spans[0].payload_json.ends_with(COMPRESSED_MARKER));
    }

    #[tokio::test]
    async fn pending_todos_format() {
        let (s, repo) = fixtures().await;
        s.replace_thread_todos_snapshot(
            "ep",
            "th1",
            r#"[
                {"id":"todo_1","content":"write tests","status":"pending"},
                {"id":"todo_2","content":"fix build","status":"in_progress","note":"blocked on CI"},
                {"id":"todo_3","content":"done thing","status":"done"}
            ]"#,
            None,
        )
        .await
        .unwrap();

        let todos = repo.thread_pending_todos("ep", "th1").await.unwrap();
        assert_eq!(
            todos,
            vec![
                "write tests".to_string(),
                "[in_progress] fix build (blocked on CI)".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn snapshot_id_is_content_addressed() {
        let (_s, repo) = fixtures().await;
        let a = repo
            .save_context_snapshot("th1", SnapshotLevel::Episode, "summary text", 0, 4, 0.72)
            .await
            .unwrap();
        let b = repo
            .save_context_snapshot("th1", SnapshotLevel::Episode, "summary text", 0, 6, 0.72)
            .await
            .unwrap();
        assert_eq!(a.snapshot_id, b.snapshot_id);

        let latest = repo
            .latest_context_snapshot("th1", SnapshotLevel::Episode)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.covers_to_turn, 6);
    }

    #[tokio::test]
    async fn capability_cache_round_trip() {
        let (_s, repo) = fixtures().await;
        let cap = ProviderCapability::fallback("openai", "gpt-test");
        repo.put_provider_capability(&cap).await.unwrap();
        let got = repo
            .get_provider_capability("openai", "gpt-test")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.max_context_tokens, 128_000);
        assert!(repo
            .get_provider_capability("openai", "unknown")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn blockers_filter_by_kind() {
        let (_s, repo) = fixtures().await;
        let now = Utc::now();
        for (id, kind) in [("m1", MemoryKind::Fact), ("m2", MemoryKind::Blocker)] {
            repo.upsert_memory_item(&MemoryItem {
                memory_id: id.into(),
                thread_id: "th1".into(),
                scope: MemoryScope::Working,
                kind,
                content: format!("content {id}"),
                source_refs: vec![],
                importance: 0.5,
                freshness: 1.0,
                confidence: 0.8,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        }
        let blockers = repo.list_blockers("th1", 10).await.unwrap();
        assert_eq!(blockers.len(), 1);
        assert_eq!(blockers[0].memory_id, "m2");
    }
}
