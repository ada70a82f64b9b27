//! Message operations on the transcript store.

use rusqlite::{params, OptionalExtension, Row};

use strand_domain::error::{Error, Result};
use strand_domain::message::{MessagePayload, MessageRecord, MessageStatus, Role};
use strand_domain::text::preview;

use crate::db::{db_err, ms_to_dt, now_ms};
use crate::TranscriptStore;

pub(crate) fn row_to_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role: String = row.get("role")?;
    let status: String = row.get("status")?;
    let payload_json: String = row.get("payload_json")?;
    Ok(MessageRecord {
        row_id: row.get("row_id")?,
        endpoint_id: row.get("endpoint_id")?,
        thread_id: row.get("thread_id")?,
        message_id: row.get("message_id")?,
        role: Role::parse(&role).unwrap_or(Role::User),
        status: MessageStatus::parse(&status).unwrap_or(MessageStatus::Complete),
        text: row.get("text")?,
        payload: serde_json::from_str(&payload_json).unwrap_or_default(),
        created_at: ms_to_dt(row.get("created_at")?),
    })
}

impl TranscriptStore {
    /// Append a message and return its dense row id. Touches the owning
    /// thread's `last_message_at` / `updated_at` and, when the message has
    /// visible text, its preview.
    pub async fn append_message(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        message_id: &str,
        role: Role,
        status: MessageStatus,
        payload: &MessagePayload,
    ) -> Result<i64> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        let message_id = message_id.to_string();
        let text = payload.render_text();
        let payload_json = serde_json::to_string(payload)?;
        self.db
            .transaction(move |conn| {
                let now = now_ms();
                conn.execute(
                    "INSERT INTO messages (endpoint_id, thread_id, message_id, role, status,
                                           text, payload_json, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        endpoint_id,
                        thread_id,
                        message_id,
                        role.as_str(),
                        status.as_str(),
                        text,
                        payload_json,
                        now
                    ],
                )
                .map_err(db_err)?;
                let row_id = conn.last_insert_rowid();

                if text.trim().is_empty() {
                    conn.execute(
                        "UPDATE threads SET last_message_at = ?3, updated_at = ?3
                         WHERE endpoint_id = ?1 AND thread_id = ?2",
                        params![endpoint_id, thread_id, now],
                    )
                    .map_err(db_err)?;
                } else {
                    conn.execute(
                        "UPDATE threads
                         SET last_message_at = ?3, updated_at = ?3, last_message_preview = ?4
                         WHERE endpoint_id = ?1 AND thread_id = ?2",
                        params![endpoint_id, thread_id, now, preview(&text, 200)],
                    )
                    .map_err(db_err)?;
                }
                Ok(row_id)
            })
            .await
    }

    /// Rewrite a message's canonical JSON in place by row id. The text
    /// column is re-rendered from the payload; the owning thread's
    /// `updated_at` is deliberately untouched.
    pub async fn update_message_json_by_row_id(
        &self,
        row_id: i64,
        payload: &MessagePayload,
        status: MessageStatus,
    ) -> Result<()> {
        let text = payload.render_text();
        let payload_json = serde_json::to_string(payload)?;
        self.db
            .call(move |conn| {
                let n = conn
                    .execute(
                        "UPDATE messages
                         SET payload_json = ?2, text = ?3, status = ?4, updated_at = ?5
                         WHERE row_id = ?1",
                        params![row_id, payload_json, text, status.as_str(), now_ms()],
                    )
                    .map_err(db_err)?;
                if n == 0 {
                    return Err(Error::Store(format!("no message with row_id {row_id}")));
                }
                Ok(())
            })
            .await
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        let message_id = message_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT * FROM messages WHERE message_id = ?1",
                    params![message_id],
                    row_to_message,
                )
                .optional()
                .map_err(db_err)
            })
            .await
    }

    /// Messages of a thread in append order.
    pub async fn list_thread_messages(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        let limit = limit.clamp(1, 10_000) as i64;
        self.db
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT * FROM (
                             SELECT * FROM messages
                             WHERE endpoint_id = ?1 AND thread_id = ?2
                             ORDER BY row_id DESC LIMIT ?3
                         ) ORDER BY row_id ASC",
                    )
                    .map_err(db_err)?;
                let mut rows = stmt
                    .query(params![endpoint_id, thread_id, limit])
                    .map_err(db_err)?;
                let mut out = Vec::new();
                while let Some(row) = rows.next().map_err(db_err)? {
                    out.push(row_to_message(row).map_err(db_err)?);
                }
                Ok(out)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_domain::message::Block;

    async fn store_with_thread() -> TranscriptStore {
        let s = TranscriptStore::open_in_memory().unwrap();
        s.create_thread("ep", "th1", "t", None).await.unwrap();
        s
    }

    #[tokio::test]
    async fn append_returns_dense_row_ids() {
        let s = store_with_thread().await;
        let payload = MessagePayload::text_only("hello");
        let r1 = s
            .append_message("ep", "th1", "m1", Role::User, MessageStatus::Complete, &payload)
            .await
            .unwrap();
        let r2 = s
            .append_message("ep", "th1", "m2", Role::Assistant, MessageStatus::Complete, &payload)
            .await
            .unwrap();
        assert!(r2 > r1);
    }

    #[tokio::test]
    async fn append_updates_thread_preview_and_timestamps() {
        let s = store_with_thread().await;
        let before = s.get_thread("ep", "th1").await.unwrap().unwrap();
        s.append_message(
            "ep",
            "th1",
            "m1",
            Role::User,
            MessageStatus::Complete,
            &MessagePayload::text_only("fix the flaky test in ci"),
        )
        .await
        .unwrap();
        let after = s.get_thread("ep", "th1").await.unwrap().unwrap();
        assert!(after.last_message_at.is_some());
        assert!(after.updated_at >= before.updated_at);
        assert_eq!(after.last_message_preview, "fix the flaky test in ci");
    }

    #[tokio::test]
    async fn json_rewrite_keeps_thread_updated_at() {
        let s = store_with_thread().await;
        let row_id = s
            .append_message(
                "ep",
                "th1",
                "m1",
                Role::Assistant,
                MessageStatus::Streaming,
                &MessagePayload::text_only("partial"),
            )
            .await
            .unwrap();
        let before = s.get_thread("ep", "th1").await.unwrap().unwrap();

        let rewritten = MessagePayload {
            blocks: vec![Block::Text {
                text: "final".into(),
            }],
        };
        s.update_message_json_by_row_id(row_id, &rewritten, MessageStatus::Complete)
            .await
            .unwrap();

        let after = s.get_thread("ep", "th1").await.unwrap().unwrap();
        assert_eq!(after.updated_at, before.updated_at);

        let msg = s.get_message("m1").await.unwrap().unwrap();
        assert_eq!(msg.text, "final");
        assert_eq!(msg.status, MessageStatus::Complete);
    }

    #[tokio::test]
    async fn rewrite_missing_row_fails() {
        let s = store_with_thread().await;
        let err = s
            .update_message_json_by_row_id(
                999,
                &MessagePayload::text_only("x"),
                MessageStatus::Complete,
            )
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn list_messages_in_append_order() {
        let s = store_with_thread().await;
        for i in 0..4 {
            s.append_message(
                "ep",
                "th1",
                &format!("m{i}"),
                if i % 2 == 0 { Role::User } else { Role::Assistant },
                MessageStatus::Complete,
                &MessagePayload::text_only(format!("msg {i}")),
            )
            .await
            .unwrap();
        }
        let msgs = s.list_thread_messages("ep", "th1", 100).await.unwrap();
        let texts: Vec<_> = msgs.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["msg 0", "msg 1", "msg 2", "msg 3"]);
    }
}
