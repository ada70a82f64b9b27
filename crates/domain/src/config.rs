//! Runtime configuration tree, loadable from TOML.
//!
//! Every section has serde defaults so a partial (or empty) config file
//! yields a fully working runtime. Knobs with hard caps are clamped at
//! load time, not at use sites.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top level
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrandConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub loop_guard: LoopGuardConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub subagents: SubagentsConfig,
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

impl StrandConfig {
    /// Parse from TOML and clamp the bounded knobs.
    pub fn from_toml(raw: &str) -> crate::error::Result<Self> {
        let mut cfg: StrandConfig =
            toml::from_str(raw).map_err(|e| crate::error::Error::Config(e.to_string()))?;
        cfg.loop_guard.clamp();
        Ok(cfg)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime budgets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum provider calls per run.
    #[serde(default = "d_max_steps")]
    pub max_steps: u32,

    /// Run wall-clock budget in milliseconds.
    #[serde(default = "d_run_max_wall_time_ms")]
    pub run_max_wall_time_ms: u64,

    /// Abort the run when the provider is silent for this long.
    #[serde(default = "d_run_idle_timeout_ms")]
    pub run_idle_timeout_ms: u64,

    /// Per-operation persistence timeout, derived from a fresh context so a
    /// slow run cannot starve its own persistence.
    #[serde(default = "d_persist_timeout_ms")]
    pub persist_timeout_ms: u64,

    /// How long an approval may stay pending before it times out.
    #[serde(default = "d_tool_approval_timeout_ms")]
    pub tool_approval_timeout_ms: u64,

    /// Per-thread actor mailbox capacity.
    #[serde(default = "d_actor_mailbox")]
    pub actor_mailbox: usize,

    /// Idle TTL after which a thread actor is torn down (reset while a run
    /// is active).
    #[serde(default = "d_actor_idle_ttl_ms")]
    pub actor_idle_ttl_ms: u64,
}

fn d_max_steps() -> u32 {
    24
}
fn d_run_max_wall_time_ms() -> u64 {
    10 * 60 * 1000
}
fn d_run_idle_timeout_ms() -> u64 {
    2 * 60 * 1000
}
fn d_persist_timeout_ms() -> u64 {
    2_000
}
fn d_tool_approval_timeout_ms() -> u64 {
    5 * 60 * 1000
}
fn d_actor_mailbox() -> usize {
    128
}
fn d_actor_idle_ttl_ms() -> u64 {
    10 * 60 * 1000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: d_max_steps(),
            run_max_wall_time_ms: d_run_max_wall_time_ms(),
            run_idle_timeout_ms: d_run_idle_timeout_ms(),
            persist_timeout_ms: d_persist_timeout_ms(),
            tool_approval_timeout_ms: d_tool_approval_timeout_ms(),
            actor_mailbox: d_actor_mailbox(),
            actor_idle_ttl_ms: d_actor_idle_ttl_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loop guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Doom-loop guard knobs. Each has a hard cap enforced by [`clamp`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopGuardConfig {
    #[serde(default = "d_max_turns")]
    pub max_turns: u32,
    #[serde(default = "d_max_no_progress_turns")]
    pub max_no_progress_turns: u32,
    #[serde(default = "d_max_repeated_signatures")]
    pub max_repeated_signatures: u32,
}

fn d_max_turns() -> u32 {
    8
}
fn d_max_no_progress_turns() -> u32 {
    2
}
fn d_max_repeated_signatures() -> u32 {
    2
}

impl LoopGuardConfig {
    pub fn clamp(&mut self) {
        self.max_turns = self.max_turns.min(32).max(1);
        self.max_no_progress_turns = self.max_no_progress_turns.min(6).max(1);
        self.max_repeated_signatures = self.max_repeated_signatures.min(6).max(1);
    }
}

impl Default for LoopGuardConfig {
    fn default() -> Self {
        Self {
            max_turns: d_max_turns(),
            max_no_progress_turns: d_max_no_progress_turns(),
            max_repeated_signatures: d_max_repeated_signatures(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Fraction of the context window the pack may fill.
    #[serde(default = "d_target_fraction")]
    pub target_fraction: f64,

    /// Lower clamp for the target fraction.
    #[serde(default = "d_target_floor")]
    pub target_floor: f64,

    /// Minimum saving ratio for a compacted pack to be accepted.
    #[serde(default = "d_required_saving")]
    pub required_saving: f64,

    /// Dialogue turns always kept verbatim by L2 folding.
    #[serde(default = "d_keep_recent_turns")]
    pub keep_recent_turns: usize,
}

fn d_target_fraction() -> f64 {
    0.7
}
fn d_target_floor() -> f64 {
    0.55
}
fn d_required_saving() -> f64 {
    0.2
}
fn d_keep_recent_turns() -> usize {
    4
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            target_fraction: d_target_fraction(),
            target_floor: d_target_floor(),
            required_saving: d_required_saving(),
            keep_recent_turns: d_keep_recent_turns(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream fan-out
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Per-subscriber writer queue capacity. Backpressure drops the client.
    #[serde(default = "d_writer_queue")]
    pub writer_queue: usize,

    /// Deadline for a single NDJSON write.
    #[serde(default = "d_write_deadline_ms")]
    pub write_deadline_ms: u64,
}

fn d_writer_queue() -> usize {
    256
}
fn d_write_deadline_ms() -> u64 {
    5_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            writer_queue: d_writer_queue(),
            write_deadline_ms: d_write_deadline_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subagents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentsConfig {
    /// Maximum live children per run.
    #[serde(default = "d_max_children")]
    pub max_children: usize,

    /// Maximum delegation depth (a child of a child is depth 2).
    #[serde(default = "d_max_depth")]
    pub max_depth: usize,

    /// Minimum interval between accepted steering messages per subagent.
    #[serde(default = "d_steer_interval_ms")]
    pub steer_interval_ms: u64,
}

fn d_max_children() -> usize {
    4
}
fn d_max_depth() -> usize {
    2
}
fn d_steer_interval_ms() -> u64 {
    2_000
}

impl Default for SubagentsConfig {
    fn default() -> Self {
        Self {
            max_children: d_max_children(),
            max_depth: d_max_depth(),
            steer_interval_ms: d_steer_interval_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pricing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-model token pricing, USD per million tokens.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub input_per_mtok: f64,
    #[serde(default)]
    pub output_per_mtok: f64,
}

impl ModelPricing {
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_mtok
            + output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}
