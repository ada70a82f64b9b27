//! Composed engine state — one long-lived object built at startup.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use strand_domain::config::StrandConfig;
use strand_domain::error::Result;
use strand_domain::run::StreamKind;
use strand_providers::ProviderRegistry;
use strand_store::{ContextRepo, TranscriptStore};
use strand_tools::builtin::todos::TodoStore;
use strand_tools::ToolRegistry;

use crate::collaborators::{MemoryRetriever, UploadStore};
use crate::runtime::approval::ApprovalGate;
use crate::runtime::cancel::RunRegistry;
use crate::runtime::events::EventHub;
use crate::runtime::subagents::SubagentManager;

/// Session permissions carried by every caller request.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionPermissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl SessionPermissions {
    pub fn rwx() -> Self {
        Self {
            read: true,
            write: true,
            execute: true,
        }
    }

    pub fn has_rwx(&self) -> bool {
        self.read && self.write && self.execute
    }
}

pub struct EngineState {
    pub config: StrandConfig,
    pub store: TranscriptStore,
    pub repo: ContextRepo,
    pub providers: ProviderRegistry,
    pub tools: ToolRegistry,
    pub runs: RunRegistry,
    pub approvals: ApprovalGate,
    pub events: EventHub,
    pub subagents: Arc<SubagentManager>,
    pub uploads: Option<Arc<dyn UploadStore>>,
    pub memory: Option<Arc<dyn MemoryRetriever>>,
}

impl EngineState {
    /// Append a run event with a fresh persistence deadline so a slow run
    /// never starves its own event log. Best effort: failures are logged.
    pub async fn persist_event(
        &self,
        run_id: Uuid,
        stream: StreamKind,
        event_type: &str,
        payload: serde_json::Value,
    ) {
        let timeout = Duration::from_millis(self.config.runtime.persist_timeout_ms.max(1));
        match tokio::time::timeout(
            timeout,
            self.store.append_run_event(run_id, stream, event_type, payload),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(%run_id, event_type, error = %e, "failed to persist run event")
            }
            Err(_) => {
                tracing::warn!(%run_id, event_type, "run event persist timed out")
            }
        }
    }
}

/// Adapter exposing the transcript store's TODO snapshot to the
/// `write_todos` handler.
pub struct StoreTodoBridge {
    pub store: TranscriptStore,
}

#[async_trait::async_trait]
impl TodoStore for StoreTodoBridge {
    async fn get(
        &self,
        endpoint_id: &str,
        thread_id: &str,
    ) -> Result<strand_domain::context::TodosSnapshot> {
        self.store
            .get_thread_todos_snapshot(endpoint_id, thread_id)
            .await
    }

    async fn replace(
        &self,
        endpoint_id: &str,
        thread_id: &str,
        todos_json: &str,
        expected_version: Option<u64>,
    ) -> Result<strand_domain::context::TodosSnapshot> {
        self.store
            .replace_thread_todos_snapshot(endpoint_id, thread_id, todos_json, expected_version)
            .await
    }
}
