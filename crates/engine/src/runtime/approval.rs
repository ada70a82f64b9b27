//! The approval gate — human-in-the-loop gating for mutating tools.
//!
//! Each pending approval is a oneshot reply port keyed by
//! `(run_id, tool_id)`. The waiting side blocks on approval, timeout, or
//! run cancellation; the resolving side is re-entrant per tool id:
//! duplicate approvals and approvals for already-terminal tools are
//! accepted no-ops.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    Timeout,
    Aborted,
}

#[derive(Default)]
pub struct ApprovalGate {
    pending: Mutex<HashMap<(Uuid, String), oneshot::Sender<bool>>>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the call is approved, rejected, timed out, or the run
    /// is cancelled.
    pub async fn wait(
        &self,
        run_id: Uuid,
        tool_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ApprovalOutcome {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert((run_id, tool_id.to_string()), tx);

        let outcome = tokio::select! {
            decision = rx => match decision {
                Ok(true) => ApprovalOutcome::Approved,
                Ok(false) => ApprovalOutcome::Rejected,
                // The sender vanished (gate dropped); treat as abort.
                Err(_) => ApprovalOutcome::Aborted,
            },
            _ = tokio::time::sleep(timeout) => ApprovalOutcome::Timeout,
            _ = cancel.cancelled() => ApprovalOutcome::Aborted,
        };

        self.pending.lock().remove(&(run_id, tool_id.to_string()));
        outcome
    }

    /// Resolve a pending approval. Returns true when a waiter was
    /// unblocked; a missing entry (duplicate approval, terminal tool) is
    /// an accepted no-op returning false.
    pub fn resolve(&self, run_id: Uuid, tool_id: &str, approved: bool) -> bool {
        match self
            .pending
            .lock()
            .remove(&(run_id, tool_id.to_string()))
        {
            Some(tx) => tx.send(approved).is_ok(),
            None => false,
        }
    }

    /// Pending approvals for introspection.
    pub fn pending_tool_ids(&self, run_id: Uuid) -> Vec<String> {
        self.pending
            .lock()
            .keys()
            .filter(|(rid, _)| *rid == run_id)
            .map(|(_, tool_id)| tool_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn approve_unblocks_waiter() {
        let gate = Arc::new(ApprovalGate::new());
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.wait(run_id, "tc_1", Duration::from_secs(2), &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.pending_tool_ids(run_id), vec!["tc_1".to_string()]);
        assert!(gate.resolve(run_id, "tc_1", true));
        assert_eq!(waiter.await.unwrap(), ApprovalOutcome::Approved);
    }

    #[tokio::test]
    async fn reject_unblocks_waiter() {
        let gate = Arc::new(ApprovalGate::new());
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.wait(run_id, "tc_1", Duration::from_secs(2), &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.resolve(run_id, "tc_1", false);
        assert_eq!(waiter.await.unwrap(), ApprovalOutcome::Rejected);
    }

    #[tokio::test]
    async fn timeout_elapses() {
        let gate = ApprovalGate::new();
        let cancel = CancellationToken::new();
        let outcome = gate
            .wait(Uuid::new_v4(), "tc_1", Duration::from_millis(80), &cancel)
            .await;
        assert_eq!(outcome, ApprovalOutcome::Timeout);
    }

    #[tokio::test]
    async fn cancellation_aborts_wait() {
        let gate = Arc::new(ApprovalGate::new());
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.wait(run_id, "tc_1", Duration::from_secs(5), &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), ApprovalOutcome::Aborted);
    }

    #[tokio::test]
    async fn duplicate_resolution_is_noop() {
        let gate = Arc::new(ApprovalGate::new());
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gate.wait(run_id, "tc_1", Duration::from_secs(2), &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gate.resolve(run_id, "tc_1", true));
        // Second approval for the same tool: accepted no-op.
        assert!(!gate.resolve(run_id, "tc_1", true));
        // Approval for a tool that never waited: accepted no-op.
        assert!(!gate.resolve(run_id, "tc_other", true));
        assert_eq!(waiter.await.unwrap(), ApprovalOutcome::Approved);
    }
}
