//! The loop guard — doom-loop detection and the per-turn outcome
//! decision.
//!
//! A *signature* fingerprints what the model just tried: the latest tool
//! call (name plus normalized `path`/`cwd` args) or the latest failure.
//! Repeating the same signature without progress is how stuck runs look.

use serde_json::Value;

use strand_domain::config::LoopGuardConfig;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signatures
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(pub String);

/// Fingerprint of a tool call: name plus the normalized key arguments.
pub fn tool_signature(name: &str, args: &Value) -> Signature {
    let mut parts = vec![name.to_string()];
    for key in ["path", "cwd"] {
        if let Some(v) = args.get(key).and_then(|v| v.as_str()) {
            let normalized = v.trim().trim_end_matches('/');
            parts.push(format!("{key}={normalized}"));
        }
    }
    // terminal.exec repeats are identified by the command string.
    if let Some(cmd) = args.get("command").and_then(|v| v.as_str()) {
        parts.push(format!("command={}", cmd.split_whitespace().collect::<Vec<_>>().join(" ")));
    }
    Signature(parts.join(" "))
}

/// Fingerprint of a failure.
pub fn failure_signature(code: &str, message: &str) -> Signature {
    Signature(format!("failure:{code}:{message}"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loop state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Clone)]
pub struct LoopState {
    pub turns: u32,
    pub no_progress_streak: u32,
    pub repeated_signatures: u32,
    pub last_signature: Option<Signature>,
}

impl LoopState {
    /// Record one finished turn: its signature (if any) and whether it
    /// made observable progress.
    pub fn observe(&mut self, signature: Option<Signature>, progressed: bool) {
        self.turns += 1;
        if progressed {
            self.no_progress_streak = 0;
        } else {
            self.no_progress_streak += 1;
        }
        match (&self.last_signature, &signature) {
            (Some(last), Some(current)) if last == current => {
                self.repeated_signatures += 1;
            }
            _ => self.repeated_signatures = 1,
        }
        if signature.is_some() {
            self.last_signature = signature;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome decision
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub enum LoopDecision {
    /// The turn answered; finalize the run.
    Complete,
    /// Keep going with an injected meta-prompt.
    Continue { meta_prompt: String },
    /// Stuck; end the run as failed with a user-visible message.
    FailStuck { user_message: String },
}

/// Non-empty and not an interim placeholder.
pub fn has_substantive_answer(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    const INTERIM: &[&str] = &[
        "working on it",
        "one moment",
        "let me check",
        "hold on",
        "thinking",
    ];
    let lower = trimmed.to_lowercase();
    !(trimmed.len() < 40 && INTERIM.iter().any(|p| lower.contains(p)))
}

/// The assistant explicitly deferred: announced work without results.
pub fn needs_follow_up(text: &str) -> bool {
    static DEFERRAL: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let deferral = DEFERRAL.get_or_init(|| {
        regex::Regex::new(
            r"(?i)\b(i(?:'ll| will) now\b|i(?:'m| am) going to\b|let me now\b|next, i will\b|i will proceed\b)",
        )
        .expect("deferral pattern compiles")
    });

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    let tail = trimmed.lines().last().unwrap_or("");
    deferral.is_match(tail) || tail.ends_with(':')
}

/// The per-turn outcome decision (§ run engine step 4).
pub fn task_loop_decision(
    cfg: &LoopGuardConfig,
    state: &LoopState,
    answer_text: &str,
) -> LoopDecision {
    let budget_exhausted = state.turns >= cfg.max_turns;
    let streak_saturated = state.no_progress_streak >= cfg.max_no_progress_turns;

    if state.repeated_signatures >= cfg.max_repeated_signatures {
        if streak_saturated || budget_exhausted {
            return LoopDecision::FailStuck {
                user_message:
                    "I tried multiple recovery strategies but got stuck repeating the same \
                     action. Stopping here so you can redirect me."
                        .into(),
            };
        }
        let forbidden = state
            .last_signature
            .as_ref()
            .map(|s| s.0.clone())
            .unwrap_or_default();
        return LoopDecision::Continue {
            meta_prompt: format!(
                "You have repeated the same action ({forbidden}) without progress. \
                 Switch strategy: do not repeat it. Try a different approach or explain \
                 what is blocking you."
            ),
        };
    }

    if needs_follow_up(answer_text) && !budget_exhausted {
        return LoopDecision::Continue {
            meta_prompt: "Do not defer. Synthesize your final answer now from what you \
                          already know and did."
                .into(),
        };
    }

    LoopDecision::Complete
}
