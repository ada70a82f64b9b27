//! The engine service — the single long-lived object a host embeds.
//!
//! All thread mutations go through the per-thread actor; the service
//! methods are thin wrappers that enqueue actor jobs and enforce the
//! caller-facing contracts (permissions, conflict sentinels, model lock,
//! waiting-prompt matching).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;
use uuid::Uuid;

use strand_domain::config::StrandConfig;
use strand_domain::error::{Error, Result};
use strand_domain::message::{Block, MessagePayload, MessageStatus, Role};
use strand_domain::run::{RunEventRecord, StreamKind};
use strand_domain::text::preview;
use strand_domain::thread::{RunState, ThreadRecord};
use strand_providers::{Provider, ProviderRegistry};
use strand_store::TranscriptStore;
use strand_tools::builtin::{self, patch::PatchApplier, search::SearchBackend, skill::SkillCatalog};
use strand_tools::ToolRegistry;

use crate::actor::{BusyProbe, ThreadManager};
use crate::collaborators::{MemoryRetriever, UploadStore};
use crate::runtime::approval::ApprovalGate;
use crate::runtime::cancel::RunRegistry;
use crate::runtime::events::{EventHub, StreamFrame};
use crate::runtime::subagents::{SubagentManager, SubagentsTool};
use crate::runtime::turn::{self, RunParams};
use crate::runtime::CANCELED_PREVIEW;
use crate::state::{EngineState, SessionPermissions, StoreTodoBridge};

/// How long lifecycle operations wait for a cancelled run to clear.
const CANCEL_WAIT: Duration = Duration::from_secs(2);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// External collaborators wired in at startup. Everything is optional;
/// missing pieces degrade to structured "not configured" behavior.
#[derive(Default)]
pub struct Collaborators {
    pub patch_applier: Option<Arc<dyn PatchApplier>>,
    pub search_backend: Option<Arc<dyn SearchBackend>>,
    pub skill_catalog: Option<Arc<dyn SkillCatalog>>,
    pub uploads: Option<Arc<dyn UploadStore>>,
    pub memory: Option<Arc<dyn MemoryRetriever>>,
}

pub struct Service {
    state: Arc<EngineState>,
    threads: ThreadManager,
    enabled: AtomicBool,
}

impl Service {
    /// Build the service: run the restart scan, register the tool set,
    /// and start with zero actors.
    pub async fn new(
        config: StrandConfig,
        store: TranscriptStore,
        providers: ProviderRegistry,
        collaborators: Collaborators,
    ) -> Result<Self> {
        // Restart scan: non-terminal persisted run states become canceled,
        // waiting_user survives untouched.
        let recovered = store.recover_run_states().await?;
        if recovered > 0 {
            tracing::info!(recovered, "restart scan rewrote stale run states");
        }

        let repo = store.context_repo();
        let mut tools = ToolRegistry::new();
        builtin::register_builtins(
            &mut tools,
            collaborators.patch_applier.clone(),
            Arc::new(StoreTodoBridge { store: store.clone() }),
            collaborators.search_backend.clone(),
            collaborators.skill_catalog.clone(),
        );

        let subagents = Arc::new(SubagentManager::new(config.subagents.clone()));
        if let Ok((provider, _)) = providers.resolve(None) {
            let provider: Arc<dyn Provider> = provider;
            tools.register(Arc::new(SubagentsTool::new(
                subagents.clone(),
                provider,
                tools.clone(),
            )));
        }

        let state = Arc::new(EngineState {
            config,
            store,
            repo,
            providers,
            tools,
            runs: RunRegistry::new(),
            approvals: ApprovalGate::new(),
            events: EventHub::new(),
            subagents,
            uploads: collaborators.uploads,
            memory: collaborators.memory,
        });

        let probe: BusyProbe = {
            let state = state.clone();
            Arc::new(move |endpoint_id, thread_id| {
                state
                    .runs
                    .active_run_for_thread(endpoint_id, thread_id)
                    .is_some()
            })
        };
        let threads = ThreadManager::new(
            state.config.runtime.actor_mailbox,
            Duration::from_millis(state.config.runtime.actor_idle_ttl_ms.max(1)),
            probe,
        );

        Ok(Self {
            state,
            threads,
            enabled: AtomicBool::new(true),
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // SendUserTurn
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn send_user_turn(&self, req: UserTurnRequest) -> Result<UserTurnAck> {
        if !self.enabled.load(Ordering::Acquire) {
            return Err(Error::NotConfigured);
        }
        if !req.permissions.has_rwx() {
            return Err(Error::RwxPermissionDenied);
        }

        let state = self.state.clone();
        let endpoint_id = req.endpoint_id.clone();
        let thread_id = req.thread_id.clone();
        self.threads
            .run(&endpoint_id, &thread_id, move || async move {
                send_user_turn_inner(state, req).await
            })
            .await?
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Lifecycle operations
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Cancel a run from any channel. Detaches the mapping first, then
    /// flips the thread state; a stale mapping (run id without an
    /// in-memory run) is detached and the thread flipped all the same.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        // Resolve the owning thread: live handle first, store second.
        let (endpoint_id, thread_id) = match self.state.runs.get(run_id) {
            Some(handle) => (handle.endpoint_id.clone(), handle.thread_id.clone()),
            None => match self.state.store.get_run(run_id).await? {
                Some(run) => (run.endpoint_id, run.thread_id),
                None => return Err(Error::InvalidArgument(format!("unknown run {run_id}"))),
            },
        };

        let state = self.state.clone();
        self.threads
            .run(&endpoint_id.clone(), &thread_id.clone(), move || async move {
                let live = state.runs.cancel(run_id).is_some();
                if !live {
                    // Stale mapping: nothing in memory, still detach and
                    // flip the thread state with no run_error.
                    state.runs.detach(run_id);
                }
                state
                    .store
                    .update_thread_run_state(
                        &endpoint_id,
                        &thread_id,
                        RunState::Canceled,
                        "",
                        None,
                    )
                    .await?;
                state
                    .store
                    .update_thread_preview(&endpoint_id, &thread_id, CANCELED_PREVIEW)
                    .await?;
                state
                    .persist_event(
                        run_id,
                        StreamKind::Lifecycle,
                        "run.cancel",
                        serde_json::json!({"live": live}),
                    )
                    .await;
                state.events.emit(
                    run_id,
                    StreamFrame::RunStatus {
                        run_id,
                        status: RunState::Canceled,
                    },
                );
                Ok(())
            })
            .await?
    }

    /// Cancel whatever run is active on a thread.
    pub async fn cancel_thread(&self, endpoint_id: &str, thread_id: &str) -> Result<()> {
        match self.state.runs.active_run_for_thread(endpoint_id, thread_id) {
            Some(run_id) => self.cancel_run(run_id).await,
            None => Ok(()),
        }
    }

    /// Delete a thread. Without `force`, an active run makes this fail
    /// with `ThreadBusy`. With `force`, active mappings are dropped
    /// immediately and the thread disappears without waiting for the run
    /// task to exit.
    pub async fn delete_thread(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        force: bool,
    ) -> Result<()> {
        let state = self.state.clone();
        let endpoint = endpoint_id.to_string();
        let thread = thread_id.to_string();
        self.threads
            .run(endpoint_id, thread_id, move || async move {
                if let Some(run_id) = state.runs.active_run_for_thread(&endpoint, &thread) {
                    if !force {
                        return Err(Error::ThreadBusy);
                    }
                    // Detach first so the exiting run cannot resurrect
                    // thread state, then cancel cooperatively.
                    state.runs.cancel(run_id);
                }
                state.store.delete_thread(&endpoint, &thread).await
            })
            .await?
    }

    pub async fn rename_thread(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        title: &str,
    ) -> Result<()> {
        let state = self.state.clone();
        let endpoint = endpoint_id.to_string();
        let thread = thread_id.to_string();
        let title = title.to_string();
        self.threads
            .run(endpoint_id, thread_id, move || async move {
                state.store.rename_thread(&endpoint, &thread, &title).await
            })
            .await?
    }

    /// Change the thread model. A locked model only changes with
    /// `explicit_restart`, which also resets the run state to idle.
    pub async fn set_thread_model(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        model: Option<&str>,
        explicit_restart: bool,
    ) -> Result<()> {
        let state = self.state.clone();
        let endpoint = endpoint_id.to_string();
        let thread = thread_id.to_string();
        let model = model.map(String::from);
        self.threads
            .run(endpoint_id, thread_id, move || async move {
                let record = state
                    .store
                    .get_thread(&endpoint, &thread)
                    .await?
                    .ok_or_else(|| Error::InvalidArgument(format!("unknown thread {thread}")))?;
                if record.model_locked
                    && model.as_deref() != record.model_id.as_deref()
                    && !explicit_restart
                {
                    return Err(Error::ModelLockViolation);
                }
                state
                    .store
                    .update_thread_model_id(&endpoint, &thread, model.as_deref())
                    .await?;
                if explicit_restart {
                    state
                        .store
                        .update_thread_run_state(&endpoint, &thread, RunState::Idle, "", None)
                        .await?;
                }
                Ok(())
            })
            .await?
    }

    /// Resolve a pending tool approval. Idempotent per tool id.
    pub async fn approve_tool(&self, run_id: Uuid, tool_id: &str, approved: bool) -> Result<()> {
        let unblocked = self.state.approvals.resolve(run_id, tool_id, approved);
        if !unblocked {
            tracing::debug!(%run_id, tool_id, "approval had no waiter (accepted no-op)");
        }
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Reads
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn get_thread(
        &self,
        endpoint_id: &str,
        thread_id: &str,
    ) -> Result<Option<ThreadRecord>> {
        self.state.store.get_thread(endpoint_id, thread_id).await
    }

    pub async fn list_run_events(&self, run_id: Uuid, limit: usize) -> Result<Vec<RunEventRecord>> {
        self.state.store.list_run_events(run_id, limit).await
    }

    /// Live frames for a run (best effort; the event log is
    /// authoritative).
    pub fn subscribe_run(&self, run_id: Uuid) -> tokio::sync::broadcast::Receiver<StreamFrame> {
        self.state.events.subscribe(run_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SendUserTurn internals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct UserTurnRequest {
    pub endpoint_id: String,
    pub thread_id: String,
    pub text: String,
    /// Upload ids; metadata is resolved best effort.
    pub attachments: Vec<String>,
    pub model: Option<String>,
    /// When set, must equal the currently active run.
    pub expected_run_id: Option<Uuid>,
    /// Required while the thread is in `waiting_user`.
    pub reply_to_waiting_prompt_id: Option<String>,
    pub permissions: SessionPermissions,
}

impl UserTurnRequest {
    pub fn text_turn(endpoint_id: &str, thread_id: &str, text: &str) -> Self {
        Self {
            endpoint_id: endpoint_id.to_string(),
            thread_id: thread_id.to_string(),
            text: text.to_string(),
            attachments: Vec::new(),
            model: None,
            expected_run_id: None,
            reply_to_waiting_prompt_id: None,
            permissions: SessionPermissions::rwx(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserTurnAck {
    pub run_id: Uuid,
    pub kind: &'static str,
    pub consumed_waiting_prompt_id: Option<String>,
}

async fn send_user_turn_inner(
    state: Arc<EngineState>,
    req: UserTurnRequest,
) -> Result<UserTurnAck> {
    let endpoint = &req.endpoint_id;
    let thread_id = &req.thread_id;

    // 2. Active-run compare-and-fail. Conflicts abort before persistence.
    let active = state.runs.active_run_for_thread(endpoint, thread_id);
    if let Some(expected) = req.expected_run_id {
        if active != Some(expected) {
            return Err(Error::RunChanged);
        }
    }

    // 3. Load (or create) the thread; enforce the model lock.
    let thread = match state.store.get_thread(endpoint, thread_id).await? {
        Some(t) => t,
        None => {
            state
                .store
                .create_thread(endpoint, thread_id, &preview(&req.text, 64), req.model.as_deref())
                .await?
        }
    };
    if thread.model_locked {
        if let Some(requested) = req.model.as_deref() {
            if Some(requested) != thread.model_id.as_deref() {
                return Err(Error::ModelSwitchRequiresExplicitRestart);
            }
        }
    }

    // 4. Waiting-prompt matching.
    let mut consumed_waiting_prompt_id = None;
    if thread.run_status == RunState::WaitingUser {
        let waiting = thread.waiting_prompt.as_ref();
        match (&req.reply_to_waiting_prompt_id, waiting) {
            (Some(reply), Some(prompt)) if *reply == prompt.prompt_id => {
                consumed_waiting_prompt_id = Some(prompt.prompt_id.clone());
            }
            _ => return Err(Error::WaitingPromptChanged),
        }
    }

    // 5. Persist the user message with resolved attachment metadata.
    let user_message_id = format!("msg_{}", Uuid::new_v4().simple());
    let mut payload = MessagePayload::default();
    if !req.text.is_empty() {
        payload.blocks.push(Block::Text {
            text: req.text.clone(),
        });
    }
    for upload_id in &req.attachments {
        let meta = match &state.uploads {
            Some(uploads) => uploads.resolve(upload_id).await,
            None => None,
        };
        match meta {
            Some(meta) if meta.media_type.as_deref().is_some_and(|m| m.starts_with("image/")) => {
                payload.blocks.push(Block::Image {
                    media_type: meta.media_type,
                    upload_id: Some(meta.upload_id),
                });
            }
            Some(meta) => payload.blocks.push(Block::File {
                name: meta.name,
                media_type: meta.media_type,
                upload_id: Some(meta.upload_id),
                size_bytes: meta.size_bytes,
            }),
            None => payload.blocks.push(Block::File {
                name: upload_id.clone(),
                media_type: None,
                upload_id: Some(upload_id.clone()),
                size_bytes: None,
            }),
        }
    }
    state
        .store
        .append_message(
            endpoint,
            thread_id,
            &user_message_id,
            Role::User,
            MessageStatus::Complete,
            &payload,
        )
        .await?;

    // 6. One active run per thread: cancel the incumbent and wait for the
    // mapping to clear before starting the replacement.
    if let Some(active) = active {
        state.runs.cancel(active);
        if !state
            .runs
            .wait_thread_clear(endpoint, thread_id, CANCEL_WAIT)
            .await
        {
            tracing::warn!(%active, "cancelled run did not clear in time");
        }
    }

    let run_id = Uuid::new_v4();
    let handle = state.runs.register(endpoint, thread_id, run_id);
    state
        .store
        .update_thread_run_state(endpoint, thread_id, RunState::Accepted, "", None)
        .await?;

    let params = RunParams {
        endpoint_id: endpoint.clone(),
        thread_id: thread_id.clone(),
        user_message_id,
        user_text: req.text.clone(),
        model_spec: req.model.clone().or(thread.model_id),
        workdir: thread.working_dir.clone().map(std::path::PathBuf::from),
    };
    let span = tracing::info_span!("run", %run_id, thread_id = %thread_id);
    tokio::spawn(turn::drive_run(state.clone(), params, handle).instrument(span));

    Ok(UserTurnAck {
        run_id,
        kind: "start",
        consumed_waiting_prompt_id,
    })
}
