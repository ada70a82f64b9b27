//! End-to-end service tests over the scripted provider.
//!
//! Each test builds a full service (in-memory store, real tool registry)
//! and drives it through `send_user_turn`, asserting on persisted state:
//! the store is authoritative, so that is what gets checked.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use strand_domain::config::StrandConfig;
use strand_domain::error::Error;
use strand_domain::message::{Block, ToolBlockStatus};
use strand_domain::run::ToolCallState;
use strand_domain::thread::RunState;
use strand_engine::service::{Collaborators, Service, UserTurnRequest};
use strand_providers::testing::{ScriptItem, ScriptedProvider};
use strand_providers::ProviderRegistry;
use strand_store::TranscriptStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The intent-classifier probe consumes the first script of every run.
fn intent() -> Vec<ScriptItem> {
    ScriptedProvider::text_turn("task")
}

async fn service_with(
    scripts: Vec<Vec<ScriptItem>>,
    tweak: impl FnOnce(&mut StrandConfig),
    collaborators: Collaborators,
) -> (Service, Arc<ScriptedProvider>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("strand_engine=debug")
        .with_test_writer()
        .try_init();
    let mut config = StrandConfig::default();
    tweak(&mut config);
    let store = TranscriptStore::open_in_memory().unwrap();
    let provider = Arc::new(ScriptedProvider::new(scripts));
    let mut registry = ProviderRegistry::new();
    registry.register(provider.clone());
    let service = Service::new(config, store, registry, collaborators)
        .await
        .unwrap();
    (service, provider)
}

/// Poll until `probe` returns Some, or panic after ~3 seconds.
async fn wait_for<T, F, Fut>(mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..120 {
        if let Some(value) = probe().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within 3s");
}

async fn wait_terminal(service: &Service, endpoint: &str, thread: &str) -> RunState {
    wait_for(|| async {
        let t = service.get_thread(endpoint, thread).await.unwrap()?;
        (t.run_status.is_terminal() || t.run_status == RunState::WaitingUser)
            .then_some(t.run_status)
    })
    .await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 1 — empty-success run
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn empty_success_run_sets_placeholder_preview() {
    let (service, _) = service_with(
        vec![intent(), ScriptedProvider::empty_turn()],
        |_| {},
        Collaborators::default(),
    )
    .await;

    let ack = service
        .send_user_turn(UserTurnRequest::text_turn("ep", "th1", "hi"))
        .await
        .unwrap();
    assert_eq!(ack.kind, "start");

    let state = wait_terminal(&service, "ep", "th1").await;
    assert_eq!(state, RunState::Success);

    let thread = service.get_thread("ep", "th1").await.unwrap().unwrap();
    assert_eq!(
        thread.last_message_preview,
        "Assistant finished without a visible response."
    );
    assert_eq!(thread.run_error, "");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 2 — approval timeout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn approval_timeout_fails_run_with_degraded_summary() {
    let (service, _) = service_with(
        vec![
            intent(),
            ScriptedProvider::tool_call_turn("tc_patch", "apply_patch", r#"{"patch":"diff"}"#),
        ],
        |cfg| cfg.runtime.tool_approval_timeout_ms = 80,
        Collaborators::default(),
    )
    .await;

    let ack = service
        .send_user_turn(UserTurnRequest::text_turn("ep", "th1", "patch it"))
        .await
        .unwrap();

    let state = wait_terminal(&service, "ep", "th1").await;
    assert_eq!(state, RunState::Failed);

    // The tool-call record keeps the precise timeout state and message.
    let record = service
        .state()
        .store
        .get_tool_call(ack.run_id, "tc_patch")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, ToolCallState::Timeout);
    assert_eq!(record.error_message.as_deref(), Some("Approval timed out"));

    // The block surfaces it as an error with the timeout message.
    let run = service.state().store.get_run(ack.run_id).await.unwrap().unwrap();
    let message = service
        .state()
        .store
        .get_message(run.assistant_message_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    let block = message
        .payload
        .blocks
        .iter()
        .find_map(|b| match b {
            Block::ToolResult { status, summary, .. } => Some((*status, summary.clone())),
            _ => None,
        })
        .expect("tool result block present");
    assert_eq!(block.0, ToolBlockStatus::Error);
    assert_eq!(block.1, "Approval timed out");

    assert!(message.text.contains("tool workflow failed"));
}

#[tokio::test]
async fn approved_tool_executes_and_run_completes() {
    struct OkApplier;
    impl strand_tools::builtin::patch::PatchApplier for OkApplier {
        fn apply(
            &self,
            _workdir: &std::path::Path,
            _patch: &str,
        ) -> strand_domain::error::Result<strand_tools::builtin::patch::PatchSummary> {
            Ok(strand_tools::builtin::patch::PatchSummary {
                files_changed: vec!["lib.rs".into()],
                insertions: 1,
                deletions: 0,
            })
        }
    }

    let (service, _) = service_with(
        vec![
            intent(),
            ScriptedProvider::tool_call_turn("tc_patch", "apply_patch", r#"{"patch":"diff"}"#),
            ScriptedProvider::text_turn("patched and verified"),
        ],
        |_| {},
        Collaborators {
            patch_applier: Some(Arc::new(OkApplier)),
            ..Default::default()
        },
    )
    .await;

    // The thread needs a working directory for apply_patch.
    let dir = tempfile::tempdir().unwrap();
    service
        .state()
        .store
        .create_thread("ep", "th1", "t", None)
        .await
        .unwrap();
    service
        .state()
        .store
        .update_thread_working_dir("ep", "th1", dir.path().to_str().unwrap())
        .await
        .unwrap();

    let ack = service
        .send_user_turn(UserTurnRequest::text_turn("ep", "th1", "patch it"))
        .await
        .unwrap();

    // Wait for the gate, then approve.
    let tool_id = wait_for(|| async {
        service
            .state()
            .approvals
            .pending_tool_ids(ack.run_id)
            .into_iter()
            .next()
    })
    .await;
    service.approve_tool(ack.run_id, &tool_id, true).await.unwrap();

    let state = wait_terminal(&service, "ep", "th1").await;
    assert_eq!(state, RunState::Success);

    let record = service
        .state()
        .store
        .get_tool_call(ack.run_id, "tc_patch")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state, ToolCallState::Success);

    // Duplicate approval after the fact is an accepted no-op.
    service.approve_tool(ack.run_id, &tool_id, true).await.unwrap();
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 3 — cross-channel cancel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn cancel_run_from_other_channel_clears_within_deadline() {
    let (service, _) = service_with(
        vec![intent(), ScriptedProvider::stalled_turn()],
        |_| {},
        Collaborators::default(),
    )
    .await;

    let ack = service
        .send_user_turn(UserTurnRequest::text_turn("ep", "th1", "long task"))
        .await
        .unwrap();

    // Let the run reach the stalled provider stream.
    tokio::time::sleep(Duration::from_millis(100)).await;
    service.cancel_run(ack.run_id).await.unwrap();

    // The run exits and mappings clear well within 2 seconds.
    wait_for(|| async {
        service
            .state()
            .runs
            .active_run_for_thread("ep", "th1")
            .is_none()
            .then_some(())
    })
    .await;
    let thread = service.get_thread("ep", "th1").await.unwrap().unwrap();
    assert_eq!(thread.run_status, RunState::Canceled);
    assert_eq!(thread.run_error, "");
    assert_eq!(thread.last_message_preview, "Canceled.");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 4 — force delete of a stuck run
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn force_delete_drops_thread_immediately() {
    let (service, _) = service_with(
        vec![intent(), ScriptedProvider::stalled_turn()],
        |_| {},
        Collaborators::default(),
    )
    .await;

    let ack = service
        .send_user_turn(UserTurnRequest::text_turn("ep", "th1", "hang forever"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Non-forced delete refuses while a run is active.
    let err = service.delete_thread("ep", "th1", false).await.unwrap_err();
    assert!(matches!(err, Error::ThreadBusy));

    // Forced delete does not wait for the run to exit.
    service.delete_thread("ep", "th1", true).await.unwrap();
    assert!(service.get_thread("ep", "th1").await.unwrap().is_none());

    // The run task exits within 2 seconds.
    wait_for(|| async {
        service.state().runs.get(ack.run_id).is_none().then_some(())
    })
    .await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 5 — TODO snapshot version conflict
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn concurrent_todo_writers_get_one_conflict() {
    let (service, _) = service_with(vec![], |_| {}, Collaborators::default()).await;
    let store = &service.state().store;
    store.create_thread("ep", "th1", "t", None).await.unwrap();
    store
        .replace_thread_todos_snapshot("ep", "th1", "[]", None)
        .await
        .unwrap();

    let a = store.replace_thread_todos_snapshot("ep", "th1", r#"["a"]"#, Some(1));
    let b = store.replace_thread_todos_snapshot("ep", "th1", r#"["b"]"#, Some(1));
    let (ra, rb) = tokio::join!(a, b);

    let winners = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let winner = ra.or(rb).unwrap();
    assert_eq!(winner.version, 2);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 6 — doom-loop guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn repeated_identical_tool_calls_trip_the_doom_loop_guard() {
    let pwd = || ScriptedProvider::tool_call_turn("tc_pwd", "terminal.exec", r#"{"command":"pwd"}"#);
    let (service, _) = service_with(
        vec![intent(), pwd(), pwd(), pwd(), pwd()],
        |_| {},
        Collaborators::default(),
    )
    .await;

    let ack = service
        .send_user_turn(UserTurnRequest::text_turn("ep", "th1", "where am i"))
        .await
        .unwrap();

    let state = wait_terminal(&service, "ep", "th1").await;
    assert_eq!(state, RunState::Failed);

    let thread = service.get_thread("ep", "th1").await.unwrap().unwrap();
    assert!(thread.run_error.contains("doom loop"));

    let events = service.list_run_events(ack.run_id, 500).await.unwrap();
    let guard_events: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "guard.doom_loop")
        .collect();
    assert!(
        !guard_events.is_empty(),
        "expected at least one guard.doom_loop event"
    );
    // The first guard event injects the switch-strategy prompt; the final
    // one is fatal.
    assert_eq!(guard_events.last().unwrap().payload["fatal"], true);

    // The user sees the stuck message in the finalized assistant text.
    let run = service.state().store.get_run(ack.run_id).await.unwrap().unwrap();
    let message = service
        .state()
        .store
        .get_message(run.assistant_message_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(message.text.contains("stuck"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool execution + snapshot consistency
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn terminal_exec_stores_full_output_and_bounded_block_view() {
    // 6000 'x' runes: the streamed view truncates at 4000, the store keeps
    // everything.
    let (service, _) = service_with(
        vec![
            intent(),
            ScriptedProvider::tool_call_turn(
                "tc_exec",
                "terminal.exec",
                r#"{"command":"printf 'x%.0s' $(seq 1 6000)"}"#,
            ),
            ScriptedProvider::text_turn("done"),
        ],
        |_| {},
        Collaborators::default(),
    )
    .await;

    let ack = service
        .send_user_turn(UserTurnRequest::text_turn("ep", "th1", "make output"))
        .await
        .unwrap();
    let state = wait_terminal(&service, "ep", "th1").await;
    assert_eq!(state, RunState::Success);

    // Authoritative record: untruncated.
    let record = service
        .state()
        .store
        .get_tool_call(ack.run_id, "tc_exec")
        .await
        .unwrap()
        .unwrap();
    let stored_stdout = record.result_json.unwrap()["data"]["stdout"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(stored_stdout.len(), 6000);

    // Snapshot: the block at its index carries the bounded view plus an
    // output_ref for late subscribers.
    let run = service.state().store.get_run(ack.run_id).await.unwrap().unwrap();
    let message = service
        .state()
        .store
        .get_message(run.assistant_message_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    let (status, output, output_ref, truncated) = message
        .payload
        .blocks
        .iter()
        .find_map(|b| match b {
            Block::ToolResult {
                status,
                output,
                output_ref,
                truncated,
                ..
            } => Some((*status, output.clone(), output_ref.clone(), *truncated)),
            _ => None,
        })
        .expect("tool result block");
    assert_eq!(status, ToolBlockStatus::Success);
    assert!(truncated);
    let framed_stdout = output.unwrap()["stdout"].as_str().unwrap().to_string();
    assert_eq!(framed_stdout.chars().count(), 4000);
    let output_ref = output_ref.unwrap();
    assert_eq!(output_ref.run_id, ack.run_id.to_string());
    assert_eq!(output_ref.tool_id, "tc_exec");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// waiting_user flow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn ask_user_parks_run_and_reply_must_match_prompt() {
    let (service, provider) = service_with(
        vec![
            intent(),
            ScriptedProvider::tool_call_turn(
                "tc_ask",
                "ask_user",
                r#"{"prompt":"deploy to staging or prod?"}"#,
            ),
        ],
        |_| {},
        Collaborators::default(),
    )
    .await;

    service
        .send_user_turn(UserTurnRequest::text_turn("ep", "th1", "deploy"))
        .await
        .unwrap();

    let state = wait_terminal(&service, "ep", "th1").await;
    assert_eq!(state, RunState::WaitingUser);
    let thread = service.get_thread("ep", "th1").await.unwrap().unwrap();
    let waiting = thread.waiting_prompt.clone().expect("waiting triple set");
    assert_eq!(waiting.tool_id, "tc_ask");

    // A reply without (or with a wrong) prompt id is rejected.
    let err = service
        .send_user_turn(UserTurnRequest::text_turn("ep", "th1", "staging"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WaitingPromptChanged));

    // A matching reply consumes the prompt and starts a new run.
    provider.push_script(intent());
    provider.push_script(ScriptedProvider::text_turn("deploying to staging"));
    let mut req = UserTurnRequest::text_turn("ep", "th1", "staging");
    req.reply_to_waiting_prompt_id = Some(waiting.prompt_id.clone());
    let ack = service.send_user_turn(req).await.unwrap();
    assert_eq!(ack.consumed_waiting_prompt_id, Some(waiting.prompt_id));

    let state = wait_terminal(&service, "ep", "th1").await;
    assert_eq!(state, RunState::Success);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Contract sentinels
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn expected_run_mismatch_fails_without_persisting_the_message() {
    let (service, _) = service_with(vec![], |_| {}, Collaborators::default()).await;
    service
        .state()
        .store
        .create_thread("ep", "th1", "t", None)
        .await
        .unwrap();

    let mut req = UserTurnRequest::text_turn("ep", "th1", "should not persist");
    req.expected_run_id = Some(Uuid::new_v4());
    let err = service.send_user_turn(req).await.unwrap_err();
    assert!(matches!(err, Error::RunChanged));

    let messages = service
        .state()
        .store
        .list_thread_messages("ep", "th1", 10)
        .await
        .unwrap();
    assert!(messages.is_empty(), "conflict must abort before persistence");
}

#[tokio::test]
async fn locked_model_rejects_switch_without_restart() {
    let (service, _) = service_with(
        vec![intent(), ScriptedProvider::text_turn("ok")],
        |_| {},
        Collaborators::default(),
    )
    .await;
    let store = &service.state().store;
    store
        .create_thread("ep", "th1", "t", Some("scripted/base-model"))
        .await
        .unwrap();
    store.update_thread_model_lock("ep", "th1", true).await.unwrap();

    let mut req = UserTurnRequest::text_turn("ep", "th1", "hello");
    req.model = Some("scripted/other-model".into());
    let err = service.send_user_turn(req).await.unwrap_err();
    assert!(matches!(err, Error::ModelSwitchRequiresExplicitRestart));

    let err = service
        .set_thread_model("ep", "th1", Some("scripted/other-model"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ModelLockViolation));

    // An explicit restart permits the change and does not bump updated_at.
    let before = service.get_thread("ep", "th1").await.unwrap().unwrap();
    service
        .set_thread_model("ep", "th1", Some("scripted/other-model"), true)
        .await
        .unwrap();
    let after = service.get_thread("ep", "th1").await.unwrap().unwrap();
    assert_eq!(after.model_id.as_deref(), Some("scripted/other-model"));
    assert_eq!(after.updated_at, before.updated_at);
}

#[tokio::test]
async fn missing_rwx_permissions_are_rejected() {
    let (service, _) = service_with(vec![], |_| {}, Collaborators::default()).await;
    let mut req = UserTurnRequest::text_turn("ep", "th1", "hi");
    req.permissions = strand_engine::SessionPermissions {
        read: true,
        write: false,
        execute: false,
    };
    let err = service.send_user_turn(req).await.unwrap_err();
    assert!(matches!(err, Error::RwxPermissionDenied));
}

#[tokio::test]
async fn second_turn_cancels_the_first_run() {
    let (service, provider) = service_with(
        vec![intent(), ScriptedProvider::stalled_turn()],
        |_| {},
        Collaborators::default(),
    )
    .await;

    let first = service
        .send_user_turn(UserTurnRequest::text_turn("ep", "th1", "first"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    provider.push_script(intent());
    provider.push_script(ScriptedProvider::text_turn("second answer"));
    let second = service
        .send_user_turn(UserTurnRequest::text_turn("ep", "th1", "second"))
        .await
        .unwrap();
    assert_ne!(first.run_id, second.run_id);

    // Only the second run may be active; it runs to success.
    assert_eq!(
        service.state().runs.active_run_for_thread("ep", "th1"),
        Some(second.run_id)
    );
    let state = wait_terminal(&service, "ep", "th1").await;
    assert_eq!(state, RunState::Success);
}
