//! Pack assembly and the token target derivation.

use strand_domain::capability::ProviderCapability;
use strand_domain::config::CompactionConfig;
use strand_domain::context::{ConversationTurn, ExecutionSpan, MemoryItem};

use crate::compactor::{self, CompactionOutcome};
use crate::pack::PromptPack;

/// Raw inputs gathered by the engine before a provider call.
#[derive(Debug, Clone, Default)]
pub struct PackInputs {
    pub system_contract: String,
    pub objective: String,
    pub constraints: Vec<String>,
    pub dialogue: Vec<ConversationTurn>,
    pub evidence: Vec<ExecutionSpan>,
    pub pending_todos: Vec<String>,
    pub blockers: Vec<String>,
    pub memory: Vec<MemoryItem>,
    pub attachments: Vec<String>,
    pub thread_snapshot: String,
}

/// Derive the pack token target from a capability entry: the window minus
/// the reserved output and a fixed margin, clamped into
/// `[floor, fraction] × max_context`.
pub fn token_target(capability: &ProviderCapability, cfg: &CompactionConfig) -> u64 {
    let max_context = capability.max_context_tokens.max(1);
    let base = max_context
        .saturating_sub(capability.max_output_tokens)
        .saturating_sub(1024);
    let ceiling = (max_context as f64 * cfg.target_fraction) as u64;
    let floor = (max_context as f64 * cfg.target_floor) as u64;
    base.clamp(floor.min(ceiling), ceiling)
}

/// Assemble a pack and, when it exceeds the target, run the compactor.
///
/// Returns the outcome carrying the (possibly compacted) pack plus any
/// snapshot drafts the caller should persist.
pub fn build_pack(
    inputs: PackInputs,
    capability: &ProviderCapability,
    cfg: &CompactionConfig,
) -> CompactionOutcome {
    let mut pack = PromptPack {
        system_contract: inputs.system_contract,
        objective: inputs.objective,
        constraints: inputs.constraints,
        dialogue: inputs.dialogue,
        evidence: inputs.evidence,
        pending_todos: inputs.pending_todos,
        blockers: inputs.blockers,
        memory: inputs.memory,
        attachments: inputs.attachments,
        thread_snapshot: inputs.thread_snapshot,
        ..Default::default()
    };
    pack.recompute_tokens();

    let target = token_target(capability, cfg);
    if pack.estimated_input_tokens <= target {
        pack.compression_quality_pass = true;
        pack.compression_saving_ratio = 0.0;
        return CompactionOutcome {
            pack,
            episode_snapshot: None,
            thread_snapshot: None,
        };
    }

    tracing::debug!(
        estimated = pack.estimated_input_tokens,
        target,
        "pack over target, compacting"
    );
    compactor::compact(pack, target, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capability(max_context: u64, max_output: u64) -> ProviderCapability {
        let mut cap = ProviderCapability::fallback("p", "m");
        cap.max_context_tokens = max_context;
        cap.max_output_tokens = max_output;
        cap
    }

    #[test]
    fn target_is_window_minus_output_and_margin() {
        let cfg = CompactionConfig::default();
        // base = 100k - 4k - 1024 ≈ 95k, ceiling = 70k → clamped to ceiling.
        assert_eq!(token_target(&capability(100_000, 4_096), &cfg), 70_000);
    }

    #[test]
    fn target_never_drops_below_floor() {
        let cfg = CompactionConfig::default();
        // base = 10k - 8k - 1024 = 976, floor = 5.5k → clamped up.
        assert_eq!(token_target(&capability(10_000, 8_000), &cfg), 5_500);
    }

    #[test]
    fn under_target_pack_passes_untouched() {
        let cfg = CompactionConfig::default();
        let inputs = PackInputs {
            system_contract: "short".into(),
            objective: "obj".into(),
            ..Default::default()
        };
        let out = build_pack(inputs, &capability(100_000, 4_096), &cfg);
        assert!(out.pack.compression_quality_pass);
        assert_eq!(out.pack.compression_saving_ratio, 0.0);
        assert!(out.episode_snapshot.is_none());
        assert!(out.thread_snapshot.is_none());
    }
}
