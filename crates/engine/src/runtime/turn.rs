//! The turn loop — one run from accepted to terminal.
//!
//! Each iteration packs context, streams one provider call, dispatches
//! any tool calls through the approval gate, and runs the outcome
//! decision. Every exit path finalizes the assistant message and the
//! thread run state; a run never disappears without a transcript entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use uuid::Uuid;

use strand_contextpack::hygiene;
use strand_contextpack::packer::{self, PackInputs};
use strand_domain::chat::{ChatMessage, ToolCall};
use strand_domain::context::{ConversationTurn, ExecutionSpan, MemoryKind, SnapshotLevel};
use strand_domain::error::Error;
use strand_domain::message::{
    Block, MessagePayload, MessageStatus, OutputRef, Role, ToolBlockStatus,
};
use strand_domain::run::{
    CompactionStats, FinalizeReason, RunBudgets, RunRecord, StreamKind, ToolCallRecord,
    ToolCallState,
};
use strand_domain::stream::{FinishReason, StreamEvent, Usage};
use strand_domain::text::preview;
use strand_domain::thread::{RunState, WaitingPrompt};
use strand_providers::classifier;
use strand_providers::{Provider, TurnRequest};
use strand_tools::tool::{codes, LifecycleSink, ToolCtx};
use strand_tools::truncate::{frame_terminal_output, redact_args};
use strand_tools::{ToolResult, ToolStatus};

use crate::runtime::approval::ApprovalOutcome;
use crate::runtime::cancel::RunHandle;
use crate::runtime::events::StreamFrame;
use crate::runtime::guard::{
    self, failure_signature, tool_signature, LoopDecision, LoopState, Signature,
};
use crate::runtime::{degraded_summary, CANCELED_PREVIEW, EMPTY_SUCCESS_PREVIEW};
use crate::state::EngineState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parameters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RunParams {
    pub endpoint_id: String,
    pub thread_id: String,
    pub user_message_id: String,
    pub user_text: String,
    pub model_spec: Option<String>,
    pub workdir: Option<std::path::PathBuf>,
}

/// Sink that forwards handler lifecycle events into the run event log and
/// the live frame stream.
struct RunLifecycleSink {
    state: Arc<EngineState>,
    run_id: Uuid,
}

impl LifecycleSink for RunLifecycleSink {
    fn emit(&self, event_type: &str, payload: serde_json::Value) {
        let state = self.state.clone();
        let run_id = self.run_id;
        let event_type = event_type.to_string();
        state.events.emit(
            run_id,
            StreamFrame::Lifecycle {
                run_id,
                event_type: event_type.clone(),
                payload: payload.clone(),
            },
        );
        tokio::spawn(async move {
            state
                .persist_event(run_id, StreamKind::Lifecycle, &event_type, payload)
                .await;
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drive one run to a terminal (or waiting_user) state. Spawned by the
/// service; owns the run's assistant message until finalization.
pub async fn drive_run(state: Arc<EngineState>, params: RunParams, handle: RunHandle) {
    let run_id = handle.run_id;
    let budgets = RunBudgets {
        max_steps: state.config.runtime.max_steps,
        max_wall_time_ms: state.config.runtime.run_max_wall_time_ms,
        idle_timeout_ms: state.config.runtime.run_idle_timeout_ms,
        max_total_tokens: None,
        max_cost_usd: None,
    };
    let mut run = RunRecord::new(params.endpoint_id.clone(), params.thread_id.clone(), budgets);
    run.run_id = run_id;
    run.model_id = params.model_spec.clone();
    run.input_preview = preview(&params.user_text, 200);
    run.state = RunState::Running;

    let message_id = format!("msg_{}", Uuid::new_v4().simple());
    let mut payload = MessagePayload::default();
    let row_id = match state
        .store
        .append_message(
            &params.endpoint_id,
            &params.thread_id,
            &message_id,
            Role::Assistant,
            MessageStatus::Streaming,
            &payload,
        )
        .await
    {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, "failed to create assistant message, aborting run");
            state.runs.detach(run_id);
            return;
        }
    };
    run.assistant_message_id = Some(message_id.clone());

    let _ = state.store.upsert_run(&run).await;
    set_thread_state(&state, &handle, RunState::Running, "", None).await;
    state
        .events
        .emit(run_id, StreamFrame::RunStatus { run_id, status: RunState::Running });
    state
        .persist_event(
            run_id,
            StreamKind::Lifecycle,
            "run.start",
            serde_json::json!({
                "user_message_id": params.user_message_id,
                "model": params.model_spec,
            }),
        )
        .await;

    let outcome = run_loop(
        &state,
        &params,
        &handle,
        &mut run,
        &message_id,
        row_id,
        &mut payload,
    )
    .await;

    finalize(&state, &params, &handle, &mut run, &message_id, row_id, &mut payload, outcome)
        .await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loop outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct RunOutcome {
    state: RunState,
    reason: FinalizeReason,
    /// Persisted thread run_error (failure states only).
    error: String,
    /// Appended to the assistant message when the answer is not
    /// substantive.
    failure_note: String,
    text: String,
    usage: Usage,
    waiting: Option<WaitingPrompt>,
}

impl RunOutcome {
    fn new(state: RunState, reason: FinalizeReason, text: String, usage: Usage) -> Self {
        Self {
            state,
            reason,
            error: String::new(),
            failure_note: String::new(),
            text,
            usage,
            waiting: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    state: &Arc<EngineState>,
    params: &RunParams,
    handle: &RunHandle,
    run: &mut RunRecord,
    message_id: &str,
    row_id: i64,
    payload: &mut MessagePayload,
) -> RunOutcome {
    let run_id = handle.run_id;
    let mut total_usage = Usage::default();
    let mut text_buf = String::new();

    let (provider, model) = match state.providers.resolve(params.model_spec.as_deref()) {
        Ok(resolved) => resolved,
        Err(e) => {
            let mut outcome = RunOutcome::new(
                RunState::Failed,
                FinalizeReason::ProviderError,
                String::new(),
                total_usage,
            );
            outcome.error = e.to_string();
            outcome.failure_note = "- no provider is configured for this thread\n".into();
            return outcome;
        }
    };
    let model_name = model
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let capability = match state
        .repo
        .get_provider_capability(provider.provider_id(), &model_name)
        .await
    {
        Ok(Some(cap)) => cap,
        _ => {
            let cap = provider.capability(&model_name);
            let _ = state.repo.put_provider_capability(&cap).await;
            cap
        }
    };

    // First-turn intent classification tags the run.
    match classifier::classify_intent(provider.as_ref(), &params.user_text, model.clone()).await
    {
        Ok(intent) => {
            run.intent = Some(intent.as_str().to_string());
            state
                .persist_event(
                    run_id,
                    StreamKind::Lifecycle,
                    "run.intent",
                    serde_json::json!({"intent": intent.as_str()}),
                )
                .await;
        }
        Err(e) => tracing::debug!(error = %e, "intent classification skipped"),
    }

    let wall_deadline = tokio::time::Instant::now()
        + Duration::from_millis(run.budgets.max_wall_time_ms.max(1));
    let idle_timeout = Duration::from_millis(run.budgets.idle_timeout_ms.max(1));

    let mut loop_state = LoopState::default();
    let mut in_run_history: Vec<ChatMessage> = Vec::new();
    let mut tool_names: HashMap<String, String> = HashMap::new();
    let mut pending_meta: Option<String> = None;
    let mut consecutive_transient = 0u32;
    let mut hygiene_retry_used = false;

    loop {
        if run.step_count >= run.budgets.max_steps {
            let mut outcome = RunOutcome::new(
                if guard::has_substantive_answer(&text_buf) {
                    RunState::Success
                } else {
                    RunState::Failed
                },
                FinalizeReason::StepBudget,
                text_buf.clone(),
                total_usage,
            );
            if outcome.state == RunState::Failed {
                outcome.error = "run step budget exhausted".into();
                outcome.failure_note = "- the step budget ran out before an answer\n".into();
            }
            return outcome;
        }
        if tokio::time::Instant::now() >= wall_deadline {
            let mut outcome = RunOutcome::new(
                RunState::TimedOut,
                FinalizeReason::WallClock,
                text_buf.clone(),
                total_usage,
            );
            outcome.error = "run wall-clock budget exhausted".into();
            outcome.failure_note = "- the wall-clock budget ran out\n".into();
            return outcome;
        }
        if handle.cancel.is_cancelled() {
            return RunOutcome::new(
                RunState::Canceled,
                FinalizeReason::Canceled,
                text_buf.clone(),
                total_usage,
            );
        }

        // ── Pack context + history hygiene ───────────────────────
        let inputs = gather_pack_inputs(state, params).await;
        let pack_outcome = packer::build_pack(inputs, &capability, &state.config.compaction);
        run.compaction = CompactionStats {
            saving_ratio: pack_outcome.pack.compression_saving_ratio,
            quality_pass: pack_outcome.pack.compression_quality_pass,
            estimated_input_tokens: pack_outcome.pack.estimated_input_tokens,
        };
        for draft in [
            pack_outcome.episode_snapshot.clone(),
            pack_outcome.thread_snapshot.clone(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = state
                .repo
                .save_context_snapshot(
                    &params.thread_id,
                    draft.level,
                    &draft.summary,
                    draft.covers_from_turn,
                    draft.covers_to_turn,
                    draft.quality,
                )
                .await;
        }

        let mut messages = pack_outcome.pack.render_messages();
        messages.extend(in_run_history.iter().cloned());
        if let Some(meta) = pending_meta.take() {
            messages.push(ChatMessage::user(meta));
        }

        // Synthesis first (folded declarations of known calls come back),
        // then the orphan drop and payload pruning.
        let (messages, synthesized) =
            hygiene::synthesize_missing_declarations(messages, &tool_names);
        let (messages, report) = hygiene::apply_history_hygiene(messages);
        if !report.is_clean() || !synthesized.is_empty() {
            state
                .persist_event(
                    run_id,
                    StreamKind::Lifecycle,
                    "history.hygiene",
                    serde_json::json!({
                        "orphan_tool_call_ids": report.orphan_tool_call_ids,
                        "pruned_payloads": report.pruned_payloads,
                        "synthesized_tool_call_ids": synthesized,
                    }),
                )
                .await;
        }

        // ── Provider call ────────────────────────────────────────
        let req = TurnRequest {
            messages,
            tools: state.tools.llm_definitions(),
            temperature: Some(0.2),
            max_tokens: None,
            model: model.clone(),
            intent_probe: false,
        };
        run.step_count += 1;
        let _ = state.store.upsert_run(run).await;

        let mut stream = match provider.stream_turn(req).await {
            Ok(s) => s,
            Err(e) => match classify_stream_error(
                e,
                &mut consecutive_transient,
                &mut hygiene_retry_used,
            ) {
                ErrorAction::Retry => continue,
                ErrorAction::Fatal(message) => {
                    let mut outcome = RunOutcome::new(
                        RunState::Failed,
                        FinalizeReason::ProviderError,
                        text_buf.clone(),
                        total_usage,
                    );
                    outcome.error = message.clone();
                    outcome.failure_note = format!("- provider call failed: {message}\n");
                    return outcome;
                }
            },
        };

        // ── Consume the stream ───────────────────────────────────
        let mut turn_text = String::new();
        let mut turn_calls: Vec<ToolCall> = Vec::new();
        let mut finish: Option<FinishReason> = None;
        let mut stream_error: Option<Error> = None;

        'stream: loop {
            let next = tokio::select! {
                event = tokio::time::timeout(idle_timeout, stream.next()) => event,
                _ = handle.cancel.cancelled() => {
                    // Drain and discard: just stop consuming.
                    return RunOutcome::new(
                        RunState::Canceled,
                        FinalizeReason::Canceled,
                        merged_text(&text_buf, &turn_text),
                        total_usage,
                    );
                }
            };
            let event = match next {
                Ok(Some(Ok(event))) => event,
                Ok(Some(Err(e))) => {
                    stream_error = Some(e);
                    break 'stream;
                }
                Ok(None) => break 'stream,
                Err(_) => {
                    let mut outcome = RunOutcome::new(
                        RunState::TimedOut,
                        FinalizeReason::IdleTimeout,
                        merged_text(&text_buf, &turn_text),
                        total_usage,
                    );
                    outcome.error = "provider stream idle timeout".into();
                    outcome.failure_note = "- the provider went silent mid-turn\n".into();
                    return outcome;
                }
            };

            match event {
                StreamEvent::TextDelta { text } => {
                    turn_text.push_str(&text);
                    state.events.emit(
                        run_id,
                        StreamFrame::AssistantDelta {
                            run_id,
                            message_id: message_id.to_string(),
                            text,
                        },
                    );
                }
                StreamEvent::ToolCallAdded { id, name, .. } => {
                    tool_names.insert(id.clone(), name.clone());
                    let block = Block::ToolCall {
                        tool_id: id.clone(),
                        name: name.clone(),
                        status: ToolBlockStatus::Pending,
                        args: serde_json::json!({}),
                    };
                    payload.blocks.push(block.clone());
                    let index = payload.blocks.len() - 1;
                    emit_block(state, run_id, message_id, index, block).await;
                    sync_snapshot(state, row_id, payload, MessageStatus::Streaming).await;
                    let record = ToolCallRecord {
                        run_id,
                        tool_id: id,
                        tool_name: name,
                        args_json: serde_json::json!({}),
                        state: ToolCallState::Pending,
                        result_json: None,
                        error_code: None,
                        error_message: None,
                        started_at: chrono::Utc::now(),
                        ended_at: None,
                    };
                    let _ = state.store.upsert_tool_call(&record).await;
                }
                StreamEvent::ToolCallDelta { id, delta } => {
                    if let Some(name) = tool_names.get(&id) {
                        if let Some(handler) = state.tools.get(name) {
                            let ctx = tool_ctx(state, params, handle, &id);
                            handler.handle_partial(&ctx, &delta);
                        }
                    }
                }
                StreamEvent::ToolCallDone { id, name, args_json } => {
                    let arguments: serde_json::Value = serde_json::from_str(&args_json)
                        .unwrap_or_else(|_| serde_json::json!({}));
                    tool_names.insert(id.clone(), name.clone());
                    let redacted = redact_args(&name, &arguments);
                    if let Some(index) = payload.tool_block_index(&id) {
                        payload.blocks[index] = Block::ToolCall {
                            tool_id: id.clone(),
                            name: name.clone(),
                            status: ToolBlockStatus::Pending,
                            args: redacted.clone(),
                        };
                        emit_block(state, run_id, message_id, index, payload.blocks[index].clone())
                            .await;
                        sync_snapshot(state, row_id, payload, MessageStatus::Streaming).await;
                    }
                    turn_calls.push(ToolCall {
                        call_id: id,
                        tool_name: name,
                        arguments,
                    });
                }
                StreamEvent::Usage { usage } => total_usage.add(&usage),
                StreamEvent::Completed { finish_reason, .. } => {
                    finish = Some(finish_reason);
                    break 'stream;
                }
                StreamEvent::Error { code, message } => {
                    stream_error =
                        Some(strand_providers::normalize::classify_provider_error(
                            &code, &message,
                        ));
                    break 'stream;
                }
            }
        }

        if let Some(e) = stream_error {
            let is_reference = e.is_tool_call_reference();
            match classify_stream_error(e, &mut consecutive_transient, &mut hygiene_retry_used) {
                ErrorAction::Retry => {
                    if is_reference {
                        state
                            .persist_event(
                                run_id,
                                StreamKind::Lifecycle,
                                "history.reference_retry",
                                serde_json::json!({}),
                            )
                            .await;
                    }
                    continue;
                }
                ErrorAction::Fatal(message) => {
                    let mut outcome = RunOutcome::new(
                        RunState::Failed,
                        FinalizeReason::ProviderError,
                        merged_text(&text_buf, &turn_text),
                        total_usage,
                    );
                    outcome.error = message.clone();
                    outcome.failure_note = format!("- provider call failed: {message}\n");
                    return outcome;
                }
            }
        }
        consecutive_transient = 0;

        if !turn_text.is_empty() {
            if !text_buf.is_empty() {
                text_buf.push('\n');
            }
            text_buf.push_str(&turn_text);
            upsert_text_block(payload, &text_buf);
            sync_snapshot(state, row_id, payload, MessageStatus::Streaming).await;
        }

        let finish = finish.unwrap_or(FinishReason::Stop);

        // ── Length / incomplete recovery ─────────────────────────
        if turn_calls.is_empty()
            && matches!(finish, FinishReason::Length | FinishReason::Incomplete)
        {
            set_thread_state(state, handle, RunState::Recovering, "", None).await;
            pending_meta = Some(
                "Your previous answer was cut off. Continue concisely and finish.".into(),
            );
            in_run_history.push(ChatMessage::assistant(turn_text.clone()));
            set_thread_state(state, handle, RunState::Running, "", None).await;
            continue;
        }

        // ── Tool dispatch ────────────────────────────────────────
        if !turn_calls.is_empty() {
            in_run_history.push(ChatMessage::assistant_with_tools(&turn_text, &turn_calls));

            let batch = dispatch_tools(
                state,
                params,
                handle,
                run,
                message_id,
                row_id,
                payload,
                &capability,
                &turn_calls,
            )
            .await;

            match batch.interrupt {
                Some(BatchInterrupt::Canceled) => {
                    return RunOutcome::new(
                        RunState::Canceled,
                        FinalizeReason::Canceled,
                        text_buf.clone(),
                        total_usage,
                    );
                }
                Some(BatchInterrupt::ApprovalTimeout { tool_name }) => {
                    let mut outcome = RunOutcome::new(
                        RunState::Failed,
                        FinalizeReason::ToolError,
                        text_buf.clone(),
                        total_usage,
                    );
                    outcome.error = format!("approval timed out for {tool_name}");
                    outcome.failure_note = format!(
                        "- tool workflow failed: approval for {tool_name} timed out\n"
                    );
                    return outcome;
                }
                Some(BatchInterrupt::TaskComplete { summary }) => {
                    let text = if guard::has_substantive_answer(&text_buf) {
                        text_buf.clone()
                    } else {
                        summary
                    };
                    return RunOutcome::new(
                        RunState::Success,
                        FinalizeReason::TaskComplete,
                        text,
                        total_usage,
                    );
                }
                Some(BatchInterrupt::AskUser { prompt, tool_id }) => {
                    let prompt_id = format!("wp_{}", Uuid::new_v4().simple());
                    let mut outcome = RunOutcome::new(
                        RunState::WaitingUser,
                        FinalizeReason::AskUser,
                        if text_buf.is_empty() { prompt } else { text_buf.clone() },
                        total_usage,
                    );
                    outcome.waiting = Some(WaitingPrompt {
                        prompt_id,
                        message_id: message_id.to_string(),
                        tool_id,
                    });
                    return outcome;
                }
                None => {}
            }

            for (call_id, result_message) in batch.history {
                in_run_history.push(result_message);
                tool_names.entry(call_id).or_default();
            }

            // Doom-loop guard over the tool batch. Repeating the same
            // signature is not progress, however the calls came out.
            let signature = batch.last_signature.clone();
            let repeated = signature.is_some() && signature == loop_state.last_signature;
            let progressed = batch.progressed && !repeated;
            loop_state.observe(signature, progressed);
            match guard::task_loop_decision(&state.config.loop_guard, &loop_state, "") {
                LoopDecision::FailStuck { user_message } => {
                    state
                        .persist_event(
                            run_id,
                            StreamKind::Lifecycle,
                            "guard.doom_loop",
                            serde_json::json!({
                                "signature": loop_state.last_signature.as_ref().map(|s| s.0.clone()),
                                "repeats": loop_state.repeated_signatures,
                                "fatal": true,
                            }),
                        )
                        .await;
                    let mut outcome = RunOutcome::new(
                        RunState::Failed,
                        FinalizeReason::DoomLoop,
                        text_buf.clone(),
                        total_usage,
                    );
                    outcome.error = "doom loop: repeated identical actions without progress".into();
                    outcome.failure_note = format!("- {user_message}\n");
                    return outcome;
                }
                LoopDecision::Continue { meta_prompt } => {
                    state
                        .persist_event(
                            run_id,
                            StreamKind::Lifecycle,
                            "guard.doom_loop",
                            serde_json::json!({
                                "signature": loop_state.last_signature.as_ref().map(|s| s.0.clone()),
                                "repeats": loop_state.repeated_signatures,
                                "fatal": false,
                            }),
                        )
                        .await;
                    pending_meta = Some(meta_prompt);
                }
                LoopDecision::Complete => {}
            }
            continue;
        }

        // ── No tools: outcome decision ───────────────────────────
        let progressed = !turn_text.is_empty();
        loop_state.observe(None, progressed);
        match guard::task_loop_decision(&state.config.loop_guard, &loop_state, &turn_text) {
            LoopDecision::Complete => {
                return RunOutcome::new(
                    RunState::Success,
                    FinalizeReason::Completed,
                    text_buf.clone(),
                    total_usage,
                );
            }
            LoopDecision::Continue { meta_prompt } => {
                in_run_history.push(ChatMessage::assistant(turn_text.clone()));
                pending_meta = Some(meta_prompt);
                continue;
            }
            LoopDecision::FailStuck { user_message } => {
                let mut outcome = RunOutcome::new(
                    RunState::Failed,
                    FinalizeReason::DoomLoop,
                    text_buf.clone(),
                    total_usage,
                );
                outcome.error = "doom loop without progress".into();
                outcome.failure_note = format!("- {user_message}\n");
                return outcome;
            }
        }
    }
}

fn merged_text(text_buf: &str, turn_text: &str) -> String {
    if turn_text.is_empty() {
        text_buf.to_string()
    } else if text_buf.is_empty() {
        turn_text.to_string()
    } else {
        format!("{text_buf}\n{turn_text}")
    }
}

enum ErrorAction {
    Retry,
    Fatal(String),
}

fn classify_stream_error(
    e: Error,
    consecutive_transient: &mut u32,
    hygiene_retry_used: &mut bool,
) -> ErrorAction {
    if e.is_tool_call_reference() {
        if !*hygiene_retry_used {
            *hygiene_retry_used = true;
            return ErrorAction::Retry;
        }
        return ErrorAction::Fatal(e.to_string());
    }
    if e.is_transient() {
        *consecutive_transient += 1;
        if *consecutive_transient <= 1 {
            return ErrorAction::Retry;
        }
    }
    ErrorAction::Fatal(e.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum BatchInterrupt {
    Canceled,
    ApprovalTimeout { tool_name: String },
    TaskComplete { summary: String },
    AskUser { prompt: String, tool_id: String },
}

struct BatchResult {
    history: Vec<(String, ChatMessage)>,
    last_signature: Option<Signature>,
    progressed: bool,
    interrupt: Option<BatchInterrupt>,
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_tools(
    state: &Arc<EngineState>,
    params: &RunParams,
    handle: &RunHandle,
    run: &RunRecord,
    message_id: &str,
    row_id: i64,
    payload: &mut MessagePayload,
    capability: &strand_domain::capability::ProviderCapability,
    calls: &[ToolCall],
) -> BatchResult {
    let run_id = handle.run_id;
    let mut batch = BatchResult {
        history: Vec::new(),
        last_signature: None,
        progressed: false,
        interrupt: None,
    };

    // Parallel dispatch only when the whole batch is parallel-safe and
    // nothing needs approval.
    let all_parallel = capability.supports_parallel_tools
        && calls.len() > 1
        && calls.iter().all(|c| {
            state
                .tools
                .get(&c.tool_name)
                .map(|h| h.def().parallel_safe && !h.def().requires_approval)
                .unwrap_or(false)
        });

    if all_parallel {
        let mut futures = FuturesUnordered::new();
        for call in calls {
            batch.last_signature = Some(tool_signature(&call.tool_name, &call.arguments));
            let ctx = tool_ctx(state, params, handle, &call.call_id);
            let state = state.clone();
            let call = call.clone();
            futures.push(async move {
                let result = execute_one(&state, &ctx, &call).await;
                (call, result)
            });
        }
        // Results land in completion order, labeled by tool_call_id.
        while let Some((call, result)) = futures.next().await {
            if result.status == ToolStatus::Success {
                batch.progressed = true;
            }
            let message = record_result(
                state, params, run, message_id, row_id, payload, &call, &result,
            )
            .await;
            batch.history.push((call.call_id.clone(), message));
        }
        return batch;
    }

    for call in calls {
        if handle.cancel.is_cancelled() {
            batch.interrupt = Some(BatchInterrupt::Canceled);
            return batch;
        }
        batch.last_signature = Some(tool_signature(&call.tool_name, &call.arguments));

        let handler = state.tools.get(&call.tool_name);
        let requires_approval = handler
            .as_ref()
            .map(|h| h.def().requires_approval)
            .unwrap_or(false);

        let result = match &handler {
            None => ToolResult::error(
                codes::INVALID_ARGS,
                format!("unknown tool: {}", call.tool_name),
            ),
            Some(handler) => match handler.validate(&call.arguments) {
                Err(e) => ToolResult::error(codes::INVALID_ARGS, e.to_string()),
                Ok(()) => {
                    if requires_approval {
                        match request_approval(state, handle, &call.call_id, &call.tool_name).await
                        {
                            ApprovalOutcome::Approved => {
                                let ctx = tool_ctx(state, params, handle, &call.call_id);
                                mark_running(state, run_id, message_id, row_id, payload, call)
                                    .await;
                                handler.execute(&ctx, call.arguments.clone()).await
                            }
                            ApprovalOutcome::Rejected => {
                                ToolResult::error(codes::PERMISSION_DENIED, "permission_denied")
                            }
                            ApprovalOutcome::Timeout => {
                                let result = ToolResult::timeout("approval window elapsed");
                                let _ = record_result(
                                    state, params, run, message_id, row_id, payload, call,
                                    &result,
                                )
                                .await;
                                batch.interrupt = Some(BatchInterrupt::ApprovalTimeout {
                                    tool_name: call.tool_name.clone(),
                                });
                                return batch;
                            }
                            ApprovalOutcome::Aborted => {
                                let result = ToolResult::aborted();
                                let _ = record_result(
                                    state, params, run, message_id, row_id, payload, call,
                                    &result,
                                )
                                .await;
                                batch.interrupt = Some(BatchInterrupt::Canceled);
                                return batch;
                            }
                        }
                    } else {
                        let ctx = tool_ctx(state, params, handle, &call.call_id);
                        mark_running(state, run_id, message_id, row_id, payload, call).await;
                        handler.execute(&ctx, call.arguments.clone()).await
                    }
                }
            },
        };

        if result.status == ToolStatus::Success {
            batch.progressed = true;
        } else {
            batch.last_signature = Some(failure_signature(
                result.error.as_deref().unwrap_or("error"),
                &result.summary,
            ));
        }

        let message =
            record_result(state, params, run, message_id, row_id, payload, call, &result).await;
        batch.history.push((call.call_id.clone(), message));

        // Signal tools terminate the batch.
        match call.tool_name.as_str() {
            "task_complete" if result.status == ToolStatus::Success => {
                let summary = result.data["summary"]
                    .as_str()
                    .unwrap_or("task complete")
                    .to_string();
                batch.interrupt = Some(BatchInterrupt::TaskComplete { summary });
                return batch;
            }
            "ask_user" if result.status == ToolStatus::Success => {
                let prompt = result.data["prompt"].as_str().unwrap_or("").to_string();
                batch.interrupt = Some(BatchInterrupt::AskUser {
                    prompt,
                    tool_id: call.call_id.clone(),
                });
                return batch;
            }
            _ => {}
        }

        if result.status == ToolStatus::Aborted {
            batch.interrupt = Some(BatchInterrupt::Canceled);
            return batch;
        }
    }

    batch
}

async fn request_approval(
    state: &Arc<EngineState>,
    handle: &RunHandle,
    tool_id: &str,
    tool_name: &str,
) -> ApprovalOutcome {
    let run_id = handle.run_id;
    set_thread_state(state, handle, RunState::WaitingApproval, "", None).await;
    state.events.emit(
        run_id,
        StreamFrame::ToolApproval {
            run_id,
            tool_id: tool_id.to_string(),
            tool_name: tool_name.to_string(),
        },
    );
    state
        .persist_event(
            run_id,
            StreamKind::Tool,
            "tool_approval",
            serde_json::json!({"tool_id": tool_id, "tool_name": tool_name}),
        )
        .await;

    let timeout = Duration::from_millis(state.config.runtime.tool_approval_timeout_ms.max(1));
    let outcome = state
        .approvals
        .wait(run_id, tool_id, timeout, &handle.cancel)
        .await;

    if matches!(outcome, ApprovalOutcome::Approved | ApprovalOutcome::Rejected) {
        set_thread_state(state, handle, RunState::Running, "", None).await;
    }
    outcome
}

fn tool_ctx(
    state: &Arc<EngineState>,
    params: &RunParams,
    handle: &RunHandle,
    tool_id: &str,
) -> ToolCtx {
    ToolCtx {
        run_id: handle.run_id,
        tool_id: tool_id.to_string(),
        endpoint_id: params.endpoint_id.clone(),
        thread_id: params.thread_id.clone(),
        workdir: params.workdir.clone(),
        cancel: handle.cancel.child_token(),
        timeout: Duration::from_millis(state.config.runtime.run_idle_timeout_ms.max(1)),
        events: Arc::new(RunLifecycleSink {
            state: state.clone(),
            run_id: handle.run_id,
        }),
    }
}

async fn execute_one(
    state: &Arc<EngineState>,
    ctx: &ToolCtx,
    call: &ToolCall,
) -> ToolResult {
    match state.tools.get(&call.tool_name) {
        None => ToolResult::error(
            codes::INVALID_ARGS,
            format!("unknown tool: {}", call.tool_name),
        ),
        Some(handler) => match handler.validate(&call.arguments) {
            Err(e) => ToolResult::error(codes::INVALID_ARGS, e.to_string()),
            Ok(()) => handler.execute(ctx, call.arguments.clone()).await,
        },
    }
}

async fn mark_running(
    state: &Arc<EngineState>,
    run_id: Uuid,
    message_id: &str,
    row_id: i64,
    payload: &mut MessagePayload,
    call: &ToolCall,
) {
    if let Some(index) = payload.tool_block_index(&call.call_id) {
        payload.blocks[index] = Block::ToolCall {
            tool_id: call.call_id.clone(),
            name: call.tool_name.clone(),
            status: ToolBlockStatus::Running,
            args: redact_args(&call.tool_name, &call.arguments),
        };
        emit_block(state, run_id, message_id, index, payload.blocks[index].clone()).await;
        sync_snapshot(state, row_id, payload, MessageStatus::Streaming).await;
    }
    let record = ToolCallRecord {
        run_id,
        tool_id: call.call_id.clone(),
        tool_name: call.tool_name.clone(),
        args_json: redact_args(&call.tool_name, &call.arguments),
        state: ToolCallState::Running,
        result_json: None,
        error_code: None,
        error_message: None,
        started_at: chrono::Utc::now(),
        ended_at: None,
    };
    let _ = state.store.upsert_tool_call(&record).await;
}

/// Persist the terminal tool state, update the block, emit frames, record
/// evidence, and build the history message for the provider.
#[allow(clippy::too_many_arguments)]
async fn record_result(
    state: &Arc<EngineState>,
    params: &RunParams,
    run: &RunRecord,
    message_id: &str,
    row_id: i64,
    payload: &mut MessagePayload,
    call: &ToolCall,
    result: &ToolResult,
) -> ChatMessage {
    let run_id = run.run_id;
    let record_state = match result.status {
        ToolStatus::Success => ToolCallState::Success,
        ToolStatus::Error => ToolCallState::Error,
        ToolStatus::Timeout => ToolCallState::Timeout,
        ToolStatus::Aborted => ToolCallState::Aborted,
    };
    // Approval timeouts surface on the block as errors with the timeout
    // message; the record keeps the precise timeout state.
    let block_status = match result.status {
        ToolStatus::Success => ToolBlockStatus::Success,
        ToolStatus::Aborted => ToolBlockStatus::Aborted,
        ToolStatus::Timeout | ToolStatus::Error => ToolBlockStatus::Error,
    };

    let record = ToolCallRecord {
        run_id,
        tool_id: call.call_id.clone(),
        tool_name: call.tool_name.clone(),
        args_json: redact_args(&call.tool_name, &call.arguments),
        state: record_state,
        result_json: Some(serde_json::to_value(result).unwrap_or(serde_json::Value::Null)),
        error_code: result.error.clone(),
        error_message: if result.status == ToolStatus::Success {
            None
        } else {
            Some(if result.error.as_deref() == Some("Approval timed out") {
                "Approval timed out".to_string()
            } else {
                result.summary.clone()
            })
        },
        started_at: chrono::Utc::now(),
        ended_at: Some(chrono::Utc::now()),
    };
    let _ = state.store.upsert_tool_call(&record).await;

    // Streamed output view: terminal output is truncated, everything else
    // passes through.
    let (framed, truncated) = if call.tool_name == "terminal.exec" {
        frame_terminal_output(&result.data)
    } else {
        (result.data.clone(), false)
    };
    let output_ref = Some(OutputRef {
        run_id: run_id.to_string(),
        tool_id: call.call_id.clone(),
    });

    let summary = if result.error.as_deref() == Some("Approval timed out") {
        "Approval timed out".to_string()
    } else {
        result.summary.clone()
    };
    let block = Block::ToolResult {
        tool_id: call.call_id.clone(),
        name: call.tool_name.clone(),
        status: block_status,
        summary,
        output: if framed.is_null() { None } else { Some(framed.clone()) },
        output_ref,
        truncated,
    };
    match payload.tool_block_index(&call.call_id) {
        Some(index) => {
            payload.blocks[index] = block.clone();
            emit_block(state, run_id, message_id, index, block).await;
        }
        None => {
            payload.blocks.push(block.clone());
            let index = payload.blocks.len() - 1;
            emit_block(state, run_id, message_id, index, block).await;
        }
    }
    sync_snapshot(state, row_id, payload, MessageStatus::Streaming).await;

    // Execution evidence for future prompt packs.
    let span = ExecutionSpan {
        span_id: format!("span_{}", Uuid::new_v4().simple()),
        thread_id: params.thread_id.clone(),
        run_id: Some(run_id.to_string()),
        kind: "tool".into(),
        summary: format!(
            "{} {} ({})",
            call.tool_name,
            record_state.as_str(),
            result.summary
        ),
        payload_json: redact_args(&call.tool_name, &call.arguments).to_string(),
        at: chrono::Utc::now(),
    };
    let _ = state.repo.upsert_execution_span(&span).await;

    state
        .persist_event(
            run_id,
            StreamKind::Tool,
            "tool_result",
            serde_json::json!({
                "tool_id": call.call_id,
                "tool_name": call.tool_name,
                "status": record_state.as_str(),
            }),
        )
        .await;

    // History content: bounded framed view, labeled by tool_call_id.
    let content = if framed.is_null() {
        result.summary.clone()
    } else {
        serde_json::to_string(&framed).unwrap_or_else(|_| result.summary.clone())
    };
    ChatMessage::tool_result(
        &call.call_id,
        content,
        result.status != ToolStatus::Success,
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pack input gathering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SYSTEM_CONTRACT: &str = "You are a coding agent operating on a user workspace. \
Use the provided tools to inspect and change files, run commands, and manage the \
thread's TODO list. Ask the user only when genuinely blocked (ask_user). Signal \
completion with task_complete. Be concise and concrete.";

async fn gather_pack_inputs(state: &Arc<EngineState>, params: &RunParams) -> PackInputs {
    let endpoint = &params.endpoint_id;
    let thread = &params.thread_id;

    let mut objective = state
        .store
        .get_thread_open_goal(endpoint, thread)
        .await
        .unwrap_or_default();
    if objective.is_empty() {
        objective = preview(&params.user_text, 300);
        let _ = state
            .store
            .set_thread_open_goal(endpoint, thread, &objective)
            .await;
    }

    let dialogue = state
        .repo
        .list_recent_dialogue_turns(endpoint, thread, 20)
        .await
        .unwrap_or_default();
    let evidence = state
        .repo
        .list_recent_execution_spans(thread, None, 20)
        .await
        .unwrap_or_default();
    let pending_todos = state
        .repo
        .thread_pending_todos(endpoint, thread)
        .await
        .unwrap_or_default();
    let blockers = state
        .repo
        .list_blockers(thread, 10)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|m| m.content)
        .collect();

    let all_memory = state
        .repo
        .list_recent_memory_items(thread, 40)
        .await
        .unwrap_or_default();
    let constraints: Vec<String> = all_memory
        .iter()
        .filter(|m| m.kind == MemoryKind::Constraint)
        .map(|m| m.content.clone())
        .collect();
    let memory = match &state.memory {
        Some(retriever) => retriever
            .retrieve(thread, &params.user_text, 12)
            .await
            .unwrap_or_default(),
        None => all_memory
            .into_iter()
            .filter(|m| m.kind != MemoryKind::Constraint && m.kind != MemoryKind::Blocker)
            .take(12)
            .collect(),
    };

    let thread_snapshot = state
        .repo
        .latest_context_snapshot(thread, SnapshotLevel::Thread)
        .await
        .ok()
        .flatten()
        .map(|s| s.summary)
        .unwrap_or_default();

    let mut system_contract = SYSTEM_CONTRACT.to_string();
    if let Some(workdir) = &params.workdir {
        system_contract.push_str(&format!("\nWorking directory: {}", workdir.display()));
    }

    PackInputs {
        system_contract,
        objective,
        constraints,
        dialogue,
        evidence,
        pending_todos,
        blockers,
        memory,
        attachments: Vec::new(),
        thread_snapshot,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Finalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
async fn finalize(
    state: &Arc<EngineState>,
    params: &RunParams,
    handle: &RunHandle,
    run: &mut RunRecord,
    message_id: &str,
    row_id: i64,
    payload: &mut MessagePayload,
    outcome: RunOutcome,
) {
    let run_id = handle.run_id;
    let mut final_text = outcome.text.clone();

    // Failures finalize with whatever streamed plus the degraded summary.
    if matches!(outcome.state, RunState::Failed | RunState::TimedOut)
        && !outcome.failure_note.is_empty()
    {
        let objective = state
            .store
            .get_thread_open_goal(&params.endpoint_id, &params.thread_id)
            .await
            .unwrap_or_default();
        let summary = degraded_summary(&objective, "", &outcome.failure_note);
        if !final_text.is_empty() {
            final_text.push_str("\n\n");
        }
        final_text.push_str(&summary);
    }

    upsert_text_block(payload, &final_text);
    let message_status = if outcome.state == RunState::Failed {
        MessageStatus::Error
    } else {
        MessageStatus::Complete
    };
    sync_snapshot(state, row_id, payload, message_status).await;

    // Thread-level updates are skipped once detached: a newer run owns
    // the thread now (or the thread is being force-deleted).
    if !handle.is_detached() {
        set_thread_state(state, handle, outcome.state, &outcome.error, outcome.waiting.clone())
            .await;
        let preview_text = match outcome.state {
            RunState::Canceled => CANCELED_PREVIEW.to_string(),
            RunState::Success if final_text.trim().is_empty() => {
                EMPTY_SUCCESS_PREVIEW.to_string()
            }
            _ => preview(&final_text, 200),
        };
        let _ = state
            .store
            .update_thread_preview(&params.endpoint_id, &params.thread_id, &preview_text)
            .await;
    }

    run.output_preview = preview(&final_text, 200);
    run.input_tokens = outcome.usage.input_tokens;
    run.output_tokens = outcome.usage.output_tokens;
    run.reasoning_tokens = outcome.usage.reasoning_tokens;
    if let Some(model) = run.model_id.as_deref() {
        if let Some(pricing) = state.config.pricing.get(model) {
            run.estimated_cost_usd =
                pricing.estimate_cost(outcome.usage.input_tokens, outcome.usage.output_tokens);
        }
    }
    run.finish(outcome.state, outcome.reason);
    let _ = state.store.upsert_run(run).await;

    // Conversation turn rows pair the user turn with this answer; a
    // parked waiting_user run stays a pending turn.
    if outcome.state != RunState::WaitingUser {
        let turn = ConversationTurn {
            thread_id: params.thread_id.clone(),
            user_message_id: params.user_message_id.clone(),
            assistant_message_id: Some(message_id.to_string()),
            user_text: params.user_text.clone(),
            assistant_text: final_text.clone(),
            at: chrono::Utc::now(),
        };
        let _ = state.repo.append_conversation_turn(&turn).await;
    }

    state.subagents.terminate_all(run_id);

    state
        .persist_event(
            run_id,
            StreamKind::Lifecycle,
            "run.end",
            serde_json::json!({
                "state": outcome.state.as_str(),
                "reason": serde_json::to_value(outcome.reason).ok(),
                "usage": outcome.usage,
                "estimated_cost_usd": run.estimated_cost_usd,
                "steps": run.step_count,
            }),
        )
        .await;
    state.events.emit(
        run_id,
        StreamFrame::RunEnd {
            run_id,
            status: outcome.state,
            usage: outcome.usage,
            estimated_cost_usd: run.estimated_cost_usd,
        },
    );

    state.runs.detach(run_id);
    state.events.cleanup(run_id);
    tracing::debug!(state = outcome.state.as_str(), "run finalized");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Small helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Keep the leading text block in sync with the accumulated text.
fn upsert_text_block(payload: &mut MessagePayload, text: &str) {
    if text.is_empty() {
        return;
    }
    match payload.blocks.first_mut() {
        Some(Block::Text { text: t }) => *t = text.to_string(),
        _ => payload
            .blocks
            .insert(0, Block::Text { text: text.to_string() }),
    }
}

async fn emit_block(
    state: &Arc<EngineState>,
    run_id: Uuid,
    message_id: &str,
    index: usize,
    block: Block,
) {
    state.events.emit(
        run_id,
        StreamFrame::BlockSet {
            run_id,
            message_id: message_id.to_string(),
            index,
            block,
        },
    );
}

/// Persist the assistant message snapshot. Emitted block-set frames must
/// be reflected by the next snapshot, so this runs right after emits.
async fn sync_snapshot(
    state: &Arc<EngineState>,
    row_id: i64,
    payload: &MessagePayload,
    status: MessageStatus,
) {
    if let Err(e) = state
        .store
        .update_message_json_by_row_id(row_id, payload, status)
        .await
    {
        tracing::warn!(error = %e, "failed to sync assistant message snapshot");
    }
}

async fn set_thread_state(
    state: &Arc<EngineState>,
    handle: &RunHandle,
    run_state: RunState,
    error: &str,
    waiting: Option<WaitingPrompt>,
) {
    if handle.is_detached() {
        return;
    }
    if let Err(e) = state
        .store
        .update_thread_run_state(&handle.endpoint_id, &handle.thread_id, run_state, error, waiting)
        .await
    {
        tracing::warn!(error = %e, "failed to update thread run state");
    }
}
