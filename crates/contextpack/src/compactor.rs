//! Staged pack compaction under a quality verifier.
//!
//! Three stages run in order, stopping as soon as the pack meets the token
//! target:
//!
//! 1. **L1** — evidence compression to the span rune bounds.
//! 2. **L2** — dialogue folding into an episode snapshot paragraph.
//! 3. **L3** — aggressive pruning of evidence, memory, todos, blockers.
//!
//! The verifier accepts the compacted pack only when the saving ratio
//! clears the configured threshold and nothing load-bearing was lost;
//! otherwise the original pack is returned unchanged.

use strand_domain::config::CompactionConfig;
use strand_domain::context::SnapshotLevel;
use strand_domain::text::{rune_count, truncate_runes, truncate_runes_with};

use crate::pack::PromptPack;

/// Marker appended to compacted span fields.
const COMPRESSED_MARKER: &str = "[compressed]";
/// Rune bounds for L1 evidence compression.
const SUMMARY_MAX_RUNES: usize = 220;
const PAYLOAD_MAX_RUNES: usize = 400;

/// L2 folding shape.
const EPISODE_MAX_LINES: usize = 12;
const USER_LINE_MAX_RUNES: usize = 100;
const ASSISTANT_LINE_MAX_RUNES: usize = 120;
const EPISODE_QUALITY: f64 = 0.72;
const THREAD_QUALITY: f64 = 0.78;

/// L3 caps.
const L3_EVIDENCE_KEEP: usize = 8;
const L3_MEMORY_KEEP: usize = 8;
const L3_TODOS_KEEP: usize = 6;
const L3_BLOCKERS_KEEP: usize = 6;

/// A snapshot the caller should persist to the context repository.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotDraft {
    pub level: SnapshotLevel,
    pub summary: String,
    pub covers_from_turn: i64,
    pub covers_to_turn: i64,
    pub quality: f64,
}

/// Result of pack assembly: the pack plus snapshot drafts to persist.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub pack: PromptPack,
    pub episode_snapshot: Option<SnapshotDraft>,
    pub thread_snapshot: Option<SnapshotDraft>,
}

/// Run the staged compaction pipeline against `target` tokens.
pub fn compact(pack: PromptPack, target: u64, cfg: &CompactionConfig) -> CompactionOutcome {
    let original = pack.clone();
    let tokens_before = original.estimated_input_tokens.max(1);
    let mut pack = pack;
    let mut episode_snapshot = None;

    // ── L1: evidence compression ─────────────────────────────────
    for span in &mut pack.evidence {
        if rune_count(&span.summary) > SUMMARY_MAX_RUNES {
            span.summary =
                truncate_runes_with(&span.summary, SUMMARY_MAX_RUNES, COMPRESSED_MARKER);
        }
        if rune_count(&span.payload_json) > PAYLOAD_MAX_RUNES {
            span.payload_json =
                truncate_runes_with(&span.payload_json, PAYLOAD_MAX_RUNES, COMPRESSED_MARKER);
        }
    }
    pack.recompute_tokens();

    // ── L2: dialogue folding ─────────────────────────────────────
    if pack.estimated_input_tokens > target && pack.dialogue.len() > cfg.keep_recent_turns {
        let fold_count = pack.dialogue.len() - cfg.keep_recent_turns;
        let archived: Vec<_> = pack.dialogue.drain(..fold_count).collect();

        let mut lines = Vec::new();
        for turn in &archived {
            lines.push(format!(
                "- User: {}",
                truncate_runes(&turn.user_text, USER_LINE_MAX_RUNES)
            ));
            if !turn.is_pending() {
                lines.push(format!(
                    "- Assistant: {}",
                    truncate_runes(&turn.assistant_text, ASSISTANT_LINE_MAX_RUNES)
                ));
            }
        }
        // Keep the most recent lines when the paragraph would overflow.
        let skip = lines.len().saturating_sub(EPISODE_MAX_LINES);
        let paragraph = lines[skip..].join("\n");

        if !pack.thread_snapshot.is_empty() {
            pack.thread_snapshot.push_str("\n\n");
        }
        pack.thread_snapshot.push_str("Episode snapshot:\n");
        pack.thread_snapshot.push_str(&paragraph);

        episode_snapshot = Some(SnapshotDraft {
            level: SnapshotLevel::Episode,
            summary: paragraph,
            covers_from_turn: 0,
            covers_to_turn: fold_count as i64,
            quality: EPISODE_QUALITY,
        });
        pack.recompute_tokens();
    }

    // ── L3: aggressive pruning ───────────────────────────────────
    if pack.estimated_input_tokens > target {
        let evidence_skip = pack.evidence.len().saturating_sub(L3_EVIDENCE_KEEP);
        pack.evidence.drain(..evidence_skip);
        pack.memory.truncate(L3_MEMORY_KEEP);
        pack.pending_todos.truncate(L3_TODOS_KEEP);
        pack.blockers.truncate(L3_BLOCKERS_KEEP);
        pack.recompute_tokens();
    }

    // ── Quality verification ─────────────────────────────────────
    let tokens_after = pack.estimated_input_tokens;
    let saving_ratio = 1.0 - tokens_after as f64 / tokens_before as f64;

    if !verify(&original, &pack, saving_ratio, cfg.required_saving) {
        tracing::debug!(
            saving_ratio,
            required = cfg.required_saving,
            "compaction rejected by quality verifier, keeping original pack"
        );
        let mut pack = original;
        pack.compression_quality_pass = false;
        pack.compression_saving_ratio = 0.0;
        return CompactionOutcome {
            pack,
            episode_snapshot: None,
            thread_snapshot: None,
        };
    }

    pack.compression_saving_ratio = saving_ratio;
    pack.compression_quality_pass = true;
    let thread_snapshot = Some(SnapshotDraft {
        level: SnapshotLevel::Thread,
        summary: pack.thread_snapshot.clone(),
        covers_from_turn: 0,
        covers_to_turn: original.dialogue.len() as i64,
        quality: THREAD_QUALITY,
    });

    CompactionOutcome {
        pack,
        episode_snapshot,
        thread_snapshot,
    }
}

/// Retention checks: saving threshold, constraints intact, todo/blocker
/// counts not below their prior minima, objective verbatim.
fn verify(before: &PromptPack, after: &PromptPack, saving_ratio: f64, required: f64) -> bool {
    if saving_ratio < required {
        return false;
    }
    if after.objective != before.objective {
        return false;
    }
    for constraint in &before.constraints {
        if !after.constraints.iter().any(|c| c == constraint) {
            return false;
        }
    }
    let todos_floor = before.pending_todos.len().min(L3_TODOS_KEEP);
    if after.pending_todos.len() < todos_floor {
        return false;
    }
    let blockers_floor = before.blockers.len().min(L3_BLOCKERS_KEEP);
    if after.blockers.len() < blockers_floor {
        return false;
    }
    true
}
