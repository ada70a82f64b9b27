//! `write_todos` — replace the thread TODO snapshot.
//!
//! Constraints enforced here: at most 40 todos per write, at most one
//! `in_progress`, unique ids, ids defaulting to `todo_<n>`. Items arriving
//! without `content` are hydrated from the prior snapshot by id before
//! normalization; any hydration emits a `todos.args_hydrated` lifecycle
//! event.

use std::collections::HashSet;
use std::sync::Arc;

use strand_domain::context::{TodoItem, TodoStatus, TodosSnapshot};
use strand_domain::error::{Error, Result};

use crate::tool::{codes, ToolCtx, ToolDef, ToolHandler, ToolResult, ToolSource};

/// Maximum todos accepted in one write.
pub const MAX_TODOS: usize = 40;

/// Store interface the handler writes through. Implemented by the engine
/// on top of the transcript store.
#[async_trait::async_trait]
pub trait TodoStore: Send + Sync {
    async fn get(&self, endpoint_id: &str, thread_id: &str) -> Result<TodosSnapshot>;
    async fn replace(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        todos_json: &str,
        expected_version: Option<u64>,
    ) -> Result<TodosSnapshot>;
}

pub struct WriteTodosTool {
    def: ToolDef,
    store: Arc<dyn TodoStore>,
}

impl WriteTodosTool {
    pub fn new(store: Arc<dyn TodoStore>) -> Self {
        Self {
            def: ToolDef {
                name: "write_todos".into(),
                description:
                    "Replace the thread TODO list. Pass the complete list every time.".into(),
                schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "todos": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "id": { "type": "string" },
                                    "content": { "type": "string" },
                                    "status": { "type": "string", "enum": ["pending", "in_progress", "done"] },
                                    "note": { "type": "string" }
                                }
                            }
                        },
                        "expected_version": { "type": "integer" }
                    },
                    "required": ["todos"]
                }),
                parallel_safe: false,
                mutating: true,
                requires_approval: false,
                source: ToolSource::Builtin,
                namespace: "todos".into(),
                priority: 30,
            },
            store,
        }
    }

    /// Normalize raw todo values: default ids, reject duplicates and
    /// multiple in-progress items, hydrate missing content from `prior`.
    /// Returns the items and whether any hydration occurred.
    fn normalize(
        raw: &[serde_json::Value],
        prior: &[TodoItem],
    ) -> Result<(Vec<TodoItem>, bool)> {
        if raw.len() > MAX_TODOS {
            return Err(Error::InvalidArgument(format!(
                "too many todos: {} (max {MAX_TODOS})",
                raw.len()
            )));
        }

        let mut items = Vec::with_capacity(raw.len());
        let mut seen: HashSet<String> = HashSet::new();
        let mut in_progress = 0usize;
        let mut hydrated = false;

        for (i, value) in raw.iter().enumerate() {
            let id = value
                .get("id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(String::from)
                .unwrap_or_else(|| format!("todo_{}", i + 1));
            if !seen.insert(id.clone()) {
                return Err(Error::InvalidArgument(format!("duplicate todo id: {id}")));
            }

            let mut content = value
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if content.is_empty() {
                match prior.iter().find(|p| p.id == id) {
                    Some(prev) => {
                        content = prev.content.clone();
                        hydrated = true;
                    }
                    None => {
                        return Err(Error::InvalidArgument(format!(
                            "todo {id} has no content and no prior snapshot entry"
                        )))
                    }
                }
            }

            let status = match value.get("status").and_then(|v| v.as_str()) {
                Some("in_progress") => TodoStatus::InProgress,
                Some("done") => TodoStatus::Done,
                _ => TodoStatus::Pending,
            };
            if status == TodoStatus::InProgress {
                in_progress += 1;
                if in_progress > 1 {
                    return Err(Error::InvalidArgument(
                        "at most one todo may be in_progress".into(),
                    ));
                }
            }

            items.push(TodoItem {
                id,
                content,
                status,
                note: value
                    .get("note")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(String::from),
            });
        }

        Ok((items, hydrated))
    }
}

#[async_trait::async_trait]
impl ToolHandler for WriteTodosTool {
    fn def(&self) -> &ToolDef {
        &self.def
    }

    fn validate(&self, args: &serde_json::Value) -> Result<()> {
        let todos = args
            .get("todos")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::InvalidArgument("todos must be an array".into()))?;
        if todos.len() > MAX_TODOS {
            return Err(Error::InvalidArgument(format!(
                "too many todos: {} (max {MAX_TODOS})",
                todos.len()
            )));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ToolCtx, args: serde_json::Value) -> ToolResult {
        let raw = args
            .get("todos")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let expected_version = args.get("expected_version").and_then(|v| v.as_u64());

        let prior = match self.store.get(&ctx.endpoint_id, &ctx.thread_id).await {
            Ok(snapshot) => snapshot.items(),
            Err(e) => {
                return ToolResult::error(codes::EXEC_FAILED, format!("snapshot read failed: {e}"))
            }
        };

        let (items, hydrated) = match Self::normalize(&raw, &prior) {
            Ok(v) => v,
            Err(e) => return ToolResult::error(codes::INVALID_ARGS, e.to_string()),
        };

        if hydrated {
            ctx.events.emit(
                "todos.args_hydrated",
                serde_json::json!({
                    "tool_id": ctx.tool_id,
                    "count": items.len(),
                }),
            );
        }

        let todos_json = match serde_json::to_string(&items) {
            Ok(j) => j,
            Err(e) => return ToolResult::error(codes::EXEC_FAILED, e.to_string()),
        };

        match self
            .store
            .replace(&ctx.endpoint_id, &ctx.thread_id, &todos_json, expected_version)
            .await
        {
            Ok(snapshot) => ToolResult::success(
                format!("{} todos, version {}", items.len(), snapshot.version),
                serde_json::json!({
                    "version": snapshot.version,
                    "count": items.len(),
                    "hydrated": hydrated,
                }),
            ),
            Err(Error::ThreadTodosVersionConflict { expected, current }) => {
                let mut result = ToolResult::error(
                    "todos.version_conflict",
                    format!("expected version {expected}, current is {current}"),
                );
                result.data = serde_json::json!({"current_version": current});
                result
            }
            Err(e) => ToolResult::error(codes::EXEC_FAILED, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolStatus;
    use parking_lot::Mutex;
    use uuid::Uuid;

    /// In-memory TodoStore mirroring the transcript store semantics.
    #[derive(Default)]
    struct MemStore {
        inner: Mutex<TodosSnapshot>,
    }

    impl MemStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: Mutex::new(TodosSnapshot::empty()),
            })
        }
    }

    #[async_trait::async_trait]
    impl TodoStore for MemStore {
        async fn get(&self, _e: &str, _t: &str) -> Result<TodosSnapshot> {
            Ok(self.inner.lock().clone())
        }
        async fn replace(
            &self,
            _e: &str,
            _t: &str,
            todos_json: &str,
            expected_version: Option<u64>,
        ) -> Result<TodosSnapshot> {
            let mut inner = self.inner.lock();
            if let Some(expected) = expected_version {
                if expected != inner.version {
                    return Err(Error::ThreadTodosVersionConflict {
                        expected,
                        current: inner.version,
                    });
                }
            }
            inner.version += 1;
            inner.todos_json = todos_json.to_string();
            Ok(inner.clone())
        }
    }

    /// Sink that records emitted lifecycle events.
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    impl crate::tool::LifecycleSink for RecordingSink {
        fn emit(&self, event_type: &str, _payload: serde_json::Value) {
            self.events.lock().push(event_type.to_string());
        }
    }

    fn ctx_with_sink(sink: Arc<RecordingSink>) -> ToolCtx {
        let mut ctx = ToolCtx::test(Uuid::new_v4(), "tc_todos");
        ctx.events = sink;
        ctx
    }

    #[tokio::test]
    async fn writes_and_versions() {
        let store = MemStore::new();
        let tool = WriteTodosTool::new(store);
        let ctx = ToolCtx::test(Uuid::new_v4(), "tc");
        let result = tool
            .execute(
                &ctx,
                serde_json::json!({"todos": [{"content": "write code"}]}),
            )
            .await;
        assert_eq!(result.status, ToolStatus::Success);
        assert_eq!(result.data["version"], 1);
    }

    #[tokio::test]
    async fn default_ids_are_one_based() {
        let store = MemStore::new();
        let tool = WriteTodosTool::new(store.clone());
        let ctx = ToolCtx::test(Uuid::new_v4(), "tc");
        tool.execute(
            &ctx,
            serde_json::json!({"todos": [{"content": "a"}, {"content": "b"}]}),
        )
        .await;
        let items = store.get("ep", "th").await.unwrap().items();
        assert_eq!(items[0].id, "todo_1");
        assert_eq!(items[1].id, "todo_2");
    }

    #[tokio::test]
    async fn duplicate_ids_rejected() {
        let tool = WriteTodosTool::new(MemStore::new());
        let ctx = ToolCtx::test(Uuid::new_v4(), "tc");
        let result = tool
            .execute(
                &ctx,
                serde_json::json!({"todos": [
                    {"id": "x", "content": "a"},
                    {"id": "x", "content": "b"}
                ]}),
            )
            .await;
        assert_eq!(result.status, ToolStatus::Error);
        assert_eq!(result.error.as_deref(), Some(codes::INVALID_ARGS));
    }

    #[tokio::test]
    async fn two_in_progress_rejected() {
        let tool = WriteTodosTool::new(MemStore::new());
        let ctx = ToolCtx::test(Uuid::new_v4(), "tc");
        let result = tool
            .execute(
                &ctx,
                serde_json::json!({"todos": [
                    {"content": "a", "status": "in_progress"},
                    {"content": "b", "status": "in_progress"}
                ]}),
            )
            .await;
        assert_eq!(result.status, ToolStatus::Error);
    }

    #[tokio::test]
    async fn over_forty_todos_rejected() {
        let tool = WriteTodosTool::new(MemStore::new());
        let todos: Vec<_> = (0..41)
            .map(|i| serde_json::json!({"content": format!("t{i}")}))
            .collect();
        assert!(tool
            .validate(&serde_json::json!({"todos": todos}))
            .is_err());
    }

    #[tokio::test]
    async fn hydration_from_prior_snapshot_emits_event() {
        let store = MemStore::new();
        let tool = WriteTodosTool::new(store.clone());
        let sink = Arc::new(RecordingSink::default());
        let ctx = ctx_with_sink(sink.clone());

        tool.execute(
            &ctx,
            serde_json::json!({"todos": [{"id": "todo_1", "content": "original text"}]}),
        )
        .await;

        // Second write flips the status but omits content.
        let result = tool
            .execute(
                &ctx,
                serde_json::json!({"todos": [{"id": "todo_1", "status": "done"}]}),
            )
            .await;
        assert_eq!(result.status, ToolStatus::Success);
        assert_eq!(result.data["hydrated"], true);
        assert!(sink
            .events
            .lock()
            .contains(&"todos.args_hydrated".to_string()));

        let items = store.get("ep", "th").await.unwrap().items();
        assert_eq!(items[0].content, "original text");
        assert_eq!(items[0].status, TodoStatus::Done);
    }

    #[tokio::test]
    async fn missing_content_without_prior_rejected() {
        let tool = WriteTodosTool::new(MemStore::new());
        let ctx = ToolCtx::test(Uuid::new_v4(), "tc");
        let result = tool
            .execute(&ctx, serde_json::json!({"todos": [{"id": "ghost"}]}))
            .await;
        assert_eq!(result.status, ToolStatus::Error);
    }

    #[tokio::test]
    async fn version_conflict_maps_to_structured_error() {
        let store = MemStore::new();
        let tool = WriteTodosTool::new(store);
        let ctx = ToolCtx::test(Uuid::new_v4(), "tc");
        tool.execute(&ctx, serde_json::json!({"todos": [{"content": "a"}]}))
            .await;
        let result = tool
            .execute(
                &ctx,
                serde_json::json!({
                    "todos": [{"content": "b"}],
                    "expected_version": 9
                }),
            )
            .await;
        assert_eq!(result.status, ToolStatus::Error);
        assert_eq!(result.error.as_deref(), Some("todos.version_conflict"));
        assert_eq!(result.data["current_version"], 1);
    }
}
