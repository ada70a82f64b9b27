//! Run-engine internals: cancellation registry, approval gate, realtime
//! fan-out, the loop guard, subagent delegation, and the turn loop.

pub mod approval;
pub mod cancel;
pub mod events;
pub mod guard;
pub mod subagents;
pub mod turn;

/// Thread preview for a run that finished without visible output.
pub const EMPTY_SUCCESS_PREVIEW: &str = "Assistant finished without a visible response.";

/// Thread preview for a cancelled run.
pub const CANCELED_PREVIEW: &str = "Canceled.";

/// Build the three-section degraded summary used when a run must finalize
/// without a substantive assistant answer. The objective is embedded
/// under Next Actions, never as its own section.
pub fn degraded_summary(objective: &str, done: &str, not_done: &str) -> String {
    let mut out = String::new();
    out.push_str("## Done\n");
    out.push_str(if done.is_empty() { "- Nothing verifiable was completed.\n" } else { done });
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("\n## Not Done\n");
    out.push_str(if not_done.is_empty() { "- The request was not completed.\n" } else { not_done });
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str("\n## Next Actions\n");
    if objective.is_empty() {
        out.push_str("- Retry with a more specific request.\n");
    } else {
        out.push_str(&format!(
            "- Resume the objective: {objective}\n- Retry, or redirect me if the approach was wrong.\n"
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_summary_has_three_sections() {
        let text = degraded_summary("ship the fix", "", "- tool workflow failed: approval timed out\n");
        assert!(text.contains("## Done"));
        assert!(text.contains("## Not Done"));
        assert!(text.contains("## Next Actions"));
        assert!(text.contains("tool workflow failed"));
        // Objective lives under Next Actions, not as its own section.
        assert!(text.contains("Resume the objective: ship the fix"));
        assert!(!text.contains("## Objective"));
    }
}
