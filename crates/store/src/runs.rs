//! Run, tool-call, and run-event operations on the transcript store.

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use strand_domain::error::Result;
use strand_domain::run::{
    RunEventRecord, RunRecord, StreamKind, ToolCallRecord, ToolCallState,
};
use strand_domain::thread::RunState;

use crate::db::{db_err, ms_to_dt, now_ms};
use crate::TranscriptStore;

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let run_id: String = row.get("run_id")?;
    let state: String = row.get("state")?;
    let budgets_json: String = row.get("budgets_json")?;
    let compaction_json: String = row.get("compaction_json")?;
    let finalize: Option<String> = row.get("finalize_reason")?;
    Ok(RunRecord {
        run_id: Uuid::parse_str(&run_id).unwrap_or_default(),
        endpoint_id: row.get("endpoint_id")?,
        thread_id: row.get("thread_id")?,
        state: RunState::parse(&state).unwrap_or(RunState::Canceled),
        step_count: row.get::<_, i64>("step_count")? as u32,
        budgets: serde_json::from_str(&budgets_json).unwrap_or_default(),
        compaction: serde_json::from_str(&compaction_json).unwrap_or_default(),
        finalize_reason: finalize
            .and_then(|f| serde_json::from_value(serde_json::Value::String(f)).ok()),
        assistant_message_id: row.get("assistant_message_id")?,
        intent: row.get("intent")?,
        model_id: row.get("model_id")?,
        input_tokens: row.get::<_, i64>("input_tokens")? as u64,
        output_tokens: row.get::<_, i64>("output_tokens")? as u64,
        reasoning_tokens: row.get::<_, i64>("reasoning_tokens")? as u64,
        estimated_cost_usd: row.get("estimated_cost_usd")?,
        input_preview: row.get("input_preview")?,
        output_preview: row.get("output_preview")?,
        started_at: ms_to_dt(row.get("started_at")?),
        ended_at: row.get::<_, Option<i64>>("ended_at")?.map(ms_to_dt),
    })
}

fn row_to_tool_call(row: &Row<'_>) -> rusqlite::Result<ToolCallRecord> {
    let run_id: String = row.get("run_id")?;
    let state: String = row.get("state")?;
    let args_json: String = row.get("args_json")?;
    let result_json: Option<String> = row.get("result_json")?;
    Ok(ToolCallRecord {
        run_id: Uuid::parse_str(&run_id).unwrap_or_default(),
        tool_id: row.get("tool_id")?,
        tool_name: row.get("tool_name")?,
        args_json: serde_json::from_str(&args_json)
            .unwrap_or(serde_json::Value::Null),
        state: ToolCallState::parse(&state).unwrap_or(ToolCallState::Error),
        result_json: result_json.and_then(|r| serde_json::from_str(&r).ok()),
        error_code: row.get("error_code")?,
        error_message: row.get("error_message")?,
        started_at: ms_to_dt(row.get("started_at")?),
        ended_at: row.get::<_, Option<i64>>("ended_at")?.map(ms_to_dt),
    })
}

impl TranscriptStore {
    pub async fn upsert_run(&self, run: &RunRecord) -> Result<()> {
        let run = run.clone();
        self.db
            .call(move |conn| {
                let finalize = run
                    .finalize_reason
                    .and_then(|r| serde_json::to_value(r).ok())
                    .and_then(|v| v.as_str().map(String::from));
                conn.execute(
                    "INSERT INTO runs (run_id, endpoint_id, thread_id, state, step_count,
                                       budgets_json, compaction_json, finalize_reason,
                                       assistant_message_id, intent, model_id,
                                       input_tokens, output_tokens, reasoning_tokens,
                                       estimated_cost_usd, input_preview, output_preview,
                                       started_at, ended_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                             ?15, ?16, ?17, ?18, ?19)
                     ON CONFLICT (run_id) DO UPDATE SET
                        state = excluded.state,
                        step_count = excluded.step_count,
                        budgets_json = excluded.budgets_json,
                        compaction_json = excluded.compaction_json,
                        finalize_reason = excluded.finalize_reason,
                        assistant_message_id = excluded.assistant_message_id,
                        intent = excluded.intent,
                        model_id = excluded.model_id,
                        input_tokens = excluded.input_tokens,
                        output_tokens = excluded.output_tokens,
                        reasoning_tokens = excluded.reasoning_tokens,
                        estimated_cost_usd = excluded.estimated_cost_usd,
                        input_preview = excluded.input_preview,
                        output_preview = excluded.output_preview,
                        ended_at = excluded.ended_at",
                    params![
                        run.run_id.to_string(),
                        run.endpoint_id,
                        run.thread_id,
                        run.state.as_str(),
                        run.step_count as i64,
                        serde_json::to_string(&run.budgets)?,
                        serde_json::to_string(&run.compaction)?,
                        finalize,
                        run.assistant_message_id,
                        run.intent,
                        run.model_id,
                        run.input_tokens as i64,
                        run.output_tokens as i64,
                        run.reasoning_tokens as i64,
                        run.estimated_cost_usd,
                        run.input_preview,
                        run.output_preview,
                        run.started_at.timestamp_millis(),
                        run.ended_at.map(|t| t.timestamp_millis()),
                    ],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT * FROM runs WHERE run_id = ?1",
                    params![run_id.to_string()],
                    row_to_run,
                )
                .optional()
                .map_err(db_err)
            })
            .await
    }

    pub async fn upsert_tool_call(&self, call: &ToolCallRecord) -> Result<()> {
        let call = call.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tool_calls (run_id, tool_id, tool_name, args_json, state,
                                             result_json, error_code, error_message,
                                             started_at, ended_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT (run_id, tool_id) DO UPDATE SET
                        tool_name = excluded.tool_name,
                        args_json = excluded.args_json,
                        state = excluded.state,
                        result_json = excluded.result_json,
                        error_code = excluded.error_code,
                        error_message = excluded.error_message,
                        ended_at = excluded.ended_at",
                    params![
                        call.run_id.to_string(),
                        call.tool_id,
                        call.tool_name,
                        serde_json::to_string(&call.args_json)?,
                        call.state.as_str(),
                        call.result_json
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()?,
                        call.error_code,
                        call.error_message,
                        call.started_at.timestamp_millis(),
                        call.ended_at.map(|t| t.timestamp_millis()),
                    ],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
    }

    pub async fn get_tool_call(
        &self,
        run_id: Uuid,
        tool_id: &str,
    ) -> Result<Option<ToolCallRecord>> {
        let tool_id = tool_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT * FROM tool_calls WHERE run_id = ?1 AND tool_id = ?2",
                    params![run_id.to_string(), tool_id],
                    row_to_tool_call,
                )
                .optional()
                .map_err(db_err)
            })
            .await
    }

    /// Most recent tool calls across all runs of a thread, newest first.
    pub async fn list_recent_thread_tool_calls(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<ToolCallRecord>> {
        let endpoint_id = endpoint_id.to_string();
        let thread_id = thread_id.to_string();
        let limit = limit.clamp(1, 500) as i64;
        self.db
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT tc.* FROM tool_calls tc
                         JOIN runs r ON r.run_id = tc.run_id
                         WHERE r.endpoint_id = ?1 AND r.thread_id = ?2
                         ORDER BY tc.started_at DESC, tc.rowid DESC
                         LIMIT ?3",
                    )
                    .map_err(db_err)?;
                let mut rows = stmt
                    .query(params![endpoint_id, thread_id, limit])
                    .map_err(db_err)?;
                let mut out = Vec::new();
                while let Some(row) = rows.next().map_err(db_err)? {
                    out.push(row_to_tool_call(row).map_err(db_err)?);
                }
                Ok(out)
            })
            .await
    }

    /// Append one run event. Ordering is by `at_unix_ms`, ties broken by
    /// the rowid insertion order.
    pub async fn append_run_event(
        &self,
        run_id: Uuid,
        stream: StreamKind,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let event_type = event_type.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO run_events (run_id, stream, event_type, at_unix_ms, payload_json)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        run_id.to_string(),
                        stream.as_str(),
                        event_type,
                        now_ms(),
                        serde_json::to_string(&payload)?,
                    ],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
    }

    /// Events of a run in insertion order.
    pub async fn list_run_events(
        &self,
        run_id: Uuid,
        limit: usize,
    ) -> Result<Vec<RunEventRecord>> {
        let limit = limit.clamp(1, 10_000) as i64;
        self.db
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT run_id, stream, event_type, at_unix_ms, payload_json
                         FROM run_events WHERE run_id = ?1
                         ORDER BY event_id ASC LIMIT ?2",
                    )
                    .map_err(db_err)?;
                let mut rows = stmt
                    .query(params![run_id.to_string(), limit])
                    .map_err(db_err)?;
                let mut out = Vec::new();
                while let Some(row) = rows.next().map_err(db_err)? {
                    let rid: String = row.get(0).map_err(db_err)?;
                    let stream: String = row.get(1).map_err(db_err)?;
                    let payload: String = row.get(4).map_err(db_err)?;
                    out.push(RunEventRecord {
                        run_id: Uuid::parse_str(&rid).unwrap_or_default(),
                        stream: StreamKind::parse(&stream).unwrap_or(StreamKind::Lifecycle),
                        event_type: row.get(2).map_err(db_err)?,
                        at_unix_ms: row.get(3).map_err(db_err)?,
                        payload: serde_json::from_str(&payload)
                            .unwrap_or(serde_json::Value::Null),
                    });
                }
                Ok(out)
            })
            .await
    }
}
