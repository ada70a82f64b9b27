//! Bounded hierarchical delegation.
//!
//! A subagent is a child task with an isolated conversation context: it
//! gets the delegation contract as its system prompt, a filtered tool
//! set, and a bounded number of provider turns. Children never pass the
//! approval gate — approval-required tools are refused outright — and the
//! `subagents` tool itself is never delegated, which bounds the depth.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use strand_domain::chat::{ChatMessage, ToolCall};
use strand_domain::config::SubagentsConfig;
use strand_domain::error::{Error, Result};
use strand_domain::stream::{FinishReason, StreamEvent};
use strand_providers::{Provider, TurnRequest};
use strand_tools::tool::{codes, ToolCtx};
use strand_tools::{NullSink, ToolRegistry, ToolResult};

/// Provider turns a child may consume.
const CHILD_MAX_TURNS: usize = 4;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delegation contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Explore,
    Worker,
    Reviewer,
}

/// The strict delegation contract `subagents.create` validates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnSpec {
    pub objective: String,
    pub agent_type: AgentType,
    pub trigger_reason: String,
    pub deliverables: Vec<String>,
    pub definition_of_done: String,
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub budget: Option<u32>,
}

impl SpawnSpec {
    fn validate(&self) -> Result<()> {
        if self.objective.trim().is_empty() {
            return Err(Error::InvalidArgument("objective must not be empty".into()));
        }
        if self.trigger_reason.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "trigger_reason must not be empty".into(),
            ));
        }
        if self.deliverables.is_empty() {
            return Err(Error::InvalidArgument(
                "deliverables must not be empty".into(),
            ));
        }
        if self.definition_of_done.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "definition_of_done must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentState {
    Running,
    Done,
    Failed,
    Terminated,
}

/// Read-only view returned by list/inspect/wait.
#[derive(Debug, Clone, Serialize)]
pub struct SubagentView {
    pub subagent_id: String,
    pub parent_run_id: Uuid,
    pub agent_type: AgentType,
    pub objective: String,
    pub state: SubagentState,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
}

struct SubagentEntry {
    view: SubagentView,
    cancel: CancellationToken,
    done: Arc<Notify>,
    steering: Vec<String>,
    last_steer_at: Option<tokio::time::Instant>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct SubagentManager {
    cfg: SubagentsConfig,
    entries: Arc<Mutex<HashMap<String, SubagentEntry>>>,
}

impl SubagentManager {
    pub fn new(cfg: SubagentsConfig) -> Self {
        Self {
            cfg,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a child. Enforces the per-run child bound and the contract.
    pub fn create(
        &self,
        parent_run_id: Uuid,
        spec: SpawnSpec,
        provider: Arc<dyn Provider>,
        tools: ToolRegistry,
        workdir: Option<std::path::PathBuf>,
    ) -> Result<String> {
        spec.validate()?;
        let live = self
            .entries
            .lock()
            .values()
            .filter(|e| {
                e.view.parent_run_id == parent_run_id
                    && e.view.state == SubagentState::Running
            })
            .count();
        if live >= self.cfg.max_children {
            return Err(Error::InvalidArgument(format!(
                "subagent limit reached ({} live)",
                live
            )));
        }

        let subagent_id = format!("sub_{}", Uuid::new_v4().simple());
        let cancel = CancellationToken::new();
        let done = Arc::new(Notify::new());
        let entry = SubagentEntry {
            view: SubagentView {
                subagent_id: subagent_id.clone(),
                parent_run_id,
                agent_type: spec.agent_type,
                objective: spec.objective.clone(),
                state: SubagentState::Running,
                result: None,
                created_at: Utc::now(),
            },
            cancel: cancel.clone(),
            done: done.clone(),
            steering: Vec::new(),
            last_steer_at: None,
        };
        self.entries.lock().insert(subagent_id.clone(), entry);

        let id = subagent_id.clone();
        let entries = self.entries.clone();
        tokio::spawn(async move {
            let outcome = run_child(&spec, provider, tools, workdir, &cancel, {
                let entries = entries.clone();
                let id = id.clone();
                move || {
                    let mut guard = entries.lock();
                    guard
                        .get_mut(&id)
                        .map(|e| std::mem::take(&mut e.steering))
                        .unwrap_or_default()
                }
            })
            .await;

            let mut guard = entries.lock();
            if let Some(entry) = guard.get_mut(&id) {
                if entry.view.state == SubagentState::Running {
                    match outcome {
                        Ok(text) => {
                            entry.view.state = SubagentState::Done;
                            entry.view.result = Some(text);
                        }
                        Err(e) => {
                            entry.view.state = SubagentState::Failed;
                            entry.view.result = Some(e.to_string());
                        }
                    }
                }
                entry.done.notify_waiters();
            }
        });

        Ok(subagent_id)
    }

    /// Wait for a child to reach a terminal state.
    pub async fn wait(&self, subagent_id: &str, timeout: Duration) -> Result<SubagentView> {
        let (done, view) = {
            let guard = self.entries.lock();
            let entry = guard
                .get(subagent_id)
                .ok_or_else(|| Error::InvalidArgument(format!("unknown subagent {subagent_id}")))?;
            (entry.done.clone(), entry.view.clone())
        };
        if view.state != SubagentState::Running {
            return Ok(view);
        }
        let notified = done.notified();
        // Re-check after registering the waiter so a completion between
        // the two reads cannot strand us until the timeout.
        if let Some(current) = self.inspect(subagent_id) {
            if current.state != SubagentState::Running {
                return Ok(current);
            }
        }
        let _ = tokio::time::timeout(timeout, notified).await;
        self.inspect(subagent_id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown subagent {subagent_id}")))
    }

    pub fn list(&self, parent_run_id: Uuid) -> Vec<SubagentView> {
        let mut views: Vec<SubagentView> = self
            .entries
            .lock()
            .values()
            .filter(|e| e.view.parent_run_id == parent_run_id)
            .map(|e| e.view.clone())
            .collect();
        views.sort_by_key(|v| v.created_at);
        views
    }

    pub fn inspect(&self, subagent_id: &str) -> Option<SubagentView> {
        self.entries.lock().get(subagent_id).map(|e| e.view.clone())
    }

    /// Queue a steering message. At most one accepted message per
    /// configured interval per subagent.
    pub fn steer(&self, subagent_id: &str, message: &str) -> Result<()> {
        let mut guard = self.entries.lock();
        let entry = guard
            .get_mut(subagent_id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown subagent {subagent_id}")))?;
        if entry.view.state != SubagentState::Running {
            return Err(Error::InvalidArgument("subagent is not running".into()));
        }
        let now = tokio::time::Instant::now();
        let interval = Duration::from_millis(self.cfg.steer_interval_ms);
        if let Some(last) = entry.last_steer_at {
            if now.duration_since(last) < interval {
                return Err(Error::InvalidArgument(
                    "steering rate limit: one message per interval".into(),
                ));
            }
        }
        entry.last_steer_at = Some(now);
        entry.steering.push(message.to_string());
        Ok(())
    }

    pub fn terminate(&self, subagent_id: &str) -> bool {
        let mut guard = self.entries.lock();
        match guard.get_mut(subagent_id) {
            Some(entry) => {
                if entry.view.state == SubagentState::Running {
                    entry.view.state = SubagentState::Terminated;
                    entry.cancel.cancel();
                    entry.done.notify_waiters();
                }
                true
            }
            None => false,
        }
    }

    pub fn terminate_all(&self, parent_run_id: Uuid) -> usize {
        let ids: Vec<String> = self
            .entries
            .lock()
            .values()
            .filter(|e| {
                e.view.parent_run_id == parent_run_id
                    && e.view.state == SubagentState::Running
            })
            .map(|e| e.view.subagent_id.clone())
            .collect();
        for id in &ids {
            self.terminate(id);
        }
        ids.len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Child loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_child(
    spec: &SpawnSpec,
    provider: Arc<dyn Provider>,
    tools: ToolRegistry,
    workdir: Option<std::path::PathBuf>,
    cancel: &CancellationToken,
    mut drain_steering: impl FnMut() -> Vec<String>,
) -> Result<String> {
    let allowed: Vec<String> = spec
        .allowed_tools
        .iter()
        .filter(|name| *name != "subagents" && tools.contains(name))
        .cloned()
        .collect();
    let tool_defs: Vec<_> = tools
        .defs()
        .into_iter()
        .filter(|d| allowed.contains(&d.name))
        .map(|d| d.to_llm_definition())
        .collect();

    let mut system = format!(
        "You are a delegated {:?} subagent.\nObjective: {}\nDeliverables:\n",
        spec.agent_type, spec.objective
    );
    for d in &spec.deliverables {
        system.push_str(&format!("- {d}\n"));
    }
    system.push_str(&format!("Definition of done: {}\n", spec.definition_of_done));
    if let Some(schema) = &spec.output_schema {
        system.push_str(&format!("Answer as JSON matching: {schema}\n"));
    }

    let mut messages = vec![
        ChatMessage::system(system),
        ChatMessage::user(spec.objective.clone()),
    ];
    let max_turns = spec
        .budget
        .map(|b| (b as usize).clamp(1, CHILD_MAX_TURNS))
        .unwrap_or(CHILD_MAX_TURNS);
    let mut final_text = String::new();

    for _ in 0..max_turns {
        for steer in drain_steering() {
            messages.push(ChatMessage::user(format!("[steering] {steer}")));
        }

        let req = TurnRequest {
            messages: messages.clone(),
            tools: tool_defs.clone(),
            temperature: Some(0.2),
            max_tokens: None,
            model: None,
            intent_probe: false,
        };
        let mut stream = provider.stream_turn(req).await?;

        let mut text = String::new();
        let mut calls: Vec<ToolCall> = Vec::new();
        let mut finish = FinishReason::Stop;
        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(StreamEvent::TextDelta { text: t })) => text.push_str(&t),
                    Some(Ok(StreamEvent::ToolCallDone { id, name, args_json })) => {
                        let arguments = serde_json::from_str(&args_json)
                            .unwrap_or(serde_json::Value::Object(Default::default()));
                        calls.push(ToolCall { call_id: id, tool_name: name, arguments });
                    }
                    Some(Ok(StreamEvent::Completed { finish_reason, .. })) => {
                        finish = finish_reason;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e),
                    None => break,
                },
                _ = cancel.cancelled() => {
                    return Err(Error::Other("subagent terminated".into()));
                }
            }
        }

        if !text.is_empty() {
            final_text = text.clone();
        }
        if calls.is_empty() || finish != FinishReason::ToolCalls {
            break;
        }

        messages.push(ChatMessage::assistant_with_tools(&text, &calls));
        for call in calls {
            let result = dispatch_child_tool(&tools, &allowed, &workdir, cancel, &call).await;
            let content = serde_json::to_string(&result.data).unwrap_or_default();
            let is_error = result.status != strand_tools::ToolStatus::Success;
            messages.push(ChatMessage::tool_result(
                &call.call_id,
                if content.is_empty() || content == "null" {
                    result.summary.clone()
                } else {
                    content
                },
                is_error,
            ));
        }
    }

    Ok(final_text)
}

async fn dispatch_child_tool(
    tools: &ToolRegistry,
    allowed: &[String],
    workdir: &Option<std::path::PathBuf>,
    cancel: &CancellationToken,
    call: &ToolCall,
) -> ToolResult {
    if !allowed.contains(&call.tool_name) {
        return ToolResult::error(
            codes::PERMISSION_DENIED,
            format!("tool {} not delegated to this subagent", call.tool_name),
        );
    }
    let Some(handler) = tools.get(&call.tool_name) else {
        return ToolResult::error(codes::INVALID_ARGS, "unknown tool");
    };
    // Children never pass the approval gate.
    if handler.def().requires_approval {
        return ToolResult::error(
            codes::PERMISSION_DENIED,
            "approval-gated tools are not available to subagents",
        );
    }
    if let Err(e) = handler.validate(&call.arguments) {
        return ToolResult::error(codes::INVALID_ARGS, e.to_string());
    }
    let ctx = ToolCtx {
        run_id: Uuid::new_v4(),
        tool_id: call.call_id.clone(),
        endpoint_id: "subagent".into(),
        thread_id: "subagent".into(),
        workdir: workdir.clone(),
        cancel: cancel.child_token(),
        timeout: Duration::from_secs(60),
        events: Arc::new(NullSink),
    };
    handler.execute(&ctx, call.arguments.clone()).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The `subagents` tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use strand_tools::tool::{ToolDef, ToolHandler, ToolSource};

pub struct SubagentsTool {
    def: ToolDef,
    manager: Arc<SubagentManager>,
    provider: Arc<dyn Provider>,
    tools: ToolRegistry,
}

impl SubagentsTool {
    pub fn new(
        manager: Arc<SubagentManager>,
        provider: Arc<dyn Provider>,
        tools: ToolRegistry,
    ) -> Self {
        Self {
            def: ToolDef {
                name: "subagents".into(),
                description:
                    "Manage delegated subagents: create, wait, list, inspect, steer, \
                     terminate, terminate_all."
                        .into(),
                schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "action": {
                            "type": "string",
                            "enum": ["create", "wait", "list", "inspect", "steer",
                                     "terminate", "terminate_all"]
                        },
                        "subagent_id": { "type": "string" },
                        "message": { "type": "string", "description": "Steering message" },
                        "timeout_ms": { "type": "integer" },
                        "spec": {
                            "type": "object",
                            "properties": {
                                "objective": { "type": "string" },
                                "agent_type": { "type": "string", "enum": ["explore", "worker", "reviewer"] },
                                "trigger_reason": { "type": "string" },
                                "deliverables": { "type": "array", "items": { "type": "string" } },
                                "definition_of_done": { "type": "string" },
                                "output_schema": { "type": "object" },
                                "allowed_tools": { "type": "array", "items": { "type": "string" } },
                                "budget": { "type": "integer" }
                            },
                            "required": ["objective", "agent_type", "trigger_reason",
                                         "deliverables", "definition_of_done"]
                        }
                    },
                    "required": ["action"]
                }),
                parallel_safe: false,
                mutating: false,
                requires_approval: false,
                source: ToolSource::Subagent,
                namespace: "subagents".into(),
                priority: 80,
            },
            manager,
            provider,
            tools,
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for SubagentsTool {
    fn def(&self) -> &ToolDef {
        &self.def
    }

    fn validate(&self, args: &serde_json::Value) -> Result<()> {
        let action = args.get("action").and_then(|v| v.as_str()).unwrap_or("");
        match action {
            "create" => {
                let spec = args
                    .get("spec")
                    .ok_or_else(|| Error::InvalidArgument("create requires spec".into()))?;
                let spec: SpawnSpec = serde_json::from_value(spec.clone())
                    .map_err(|e| Error::InvalidArgument(format!("invalid spec: {e}")))?;
                spec.validate()
            }
            "wait" | "inspect" | "steer" | "terminate" => {
                if args.get("subagent_id").and_then(|v| v.as_str()).is_none() {
                    return Err(Error::InvalidArgument(format!(
                        "{action} requires subagent_id"
                    )));
                }
                Ok(())
            }
            "list" | "terminate_all" => Ok(()),
            other => Err(Error::InvalidArgument(format!("unknown action: {other}"))),
        }
    }

    async fn execute(&self, ctx: &ToolCtx, args: serde_json::Value) -> ToolResult {
        let action = args.get("action").and_then(|v| v.as_str()).unwrap_or("");
        let subagent_id = args.get("subagent_id").and_then(|v| v.as_str());

        match action {
            "create" => {
                let spec: SpawnSpec = match args
                    .get("spec")
                    .cloned()
                    .ok_or_else(|| Error::InvalidArgument("create requires spec".into()))
                    .and_then(|v| {
                        serde_json::from_value(v)
                            .map_err(|e| Error::InvalidArgument(e.to_string()))
                    }) {
                    Ok(s) => s,
                    Err(e) => return ToolResult::error(codes::INVALID_ARGS, e.to_string()),
                };
                match self.manager.create(
                    ctx.run_id,
                    spec,
                    self.provider.clone(),
                    self.tools.clone(),
                    ctx.workdir.clone(),
                ) {
                    Ok(id) => ToolResult::success(
                        format!("subagent {id} created"),
                        serde_json::json!({"subagent_id": id}),
                    ),
                    Err(e) => ToolResult::error(codes::INVALID_ARGS, e.to_string()),
                }
            }
            "wait" => {
                let timeout = args
                    .get("timeout_ms")
                    .and_then(|v| v.as_u64())
                    .map(Duration::from_millis)
                    .unwrap_or(Duration::from_secs(120));
                match self.manager.wait(subagent_id.unwrap_or(""), timeout).await {
                    Ok(view) => ToolResult::success(
                        format!("subagent is {:?}", view.state),
                        serde_json::to_value(&view).unwrap_or_default(),
                    ),
                    Err(e) => ToolResult::error(codes::INVALID_ARGS, e.to_string()),
                }
            }
            "list" => {
                let views = self.manager.list(ctx.run_id);
                ToolResult::success(
                    format!("{} subagents", views.len()),
                    serde_json::json!({ "subagents": views }),
                )
            }
            "inspect" => match self.manager.inspect(subagent_id.unwrap_or("")) {
                Some(view) => ToolResult::success(
                    format!("subagent is {:?}", view.state),
                    serde_json::to_value(&view).unwrap_or_default(),
                ),
                None => ToolResult::error(codes::INVALID_ARGS, "unknown subagent"),
            },
            "steer" => {
                let message = args.get("message").and_then(|v| v.as_str()).unwrap_or("");
                match self.manager.steer(subagent_id.unwrap_or(""), message) {
                    Ok(()) => ToolResult::success("steering queued", serde_json::Value::Null),
                    Err(e) => ToolResult::error(codes::INVALID_ARGS, e.to_string()),
                }
            }
            "terminate" => {
                let found = self.manager.terminate(subagent_id.unwrap_or(""));
                if found {
                    ToolResult::success("terminated", serde_json::Value::Null)
                } else {
                    ToolResult::error(codes::INVALID_ARGS, "unknown subagent")
                }
            }
            "terminate_all" => {
                let n = self.manager.terminate_all(ctx.run_id);
                ToolResult::success(
                    format!("{n} subagents terminated"),
                    serde_json::json!({"terminated": n}),
                )
            }
            other => ToolResult::error(codes::INVALID_ARGS, format!("unknown action {other}")),
        }
    }
}
