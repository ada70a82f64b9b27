//! History hygiene — reference integrity and payload pruning over the
//! provider history view.
//!
//! Runs before every provider call, in order:
//!
//! 1. *Reference integrity*: a tool_result whose `tool_call_id` has no
//!    declaration in an **earlier** assistant message is dropped (a
//!    declaration inside the same message counts as out-of-order).
//! 2. *Payload pruning*: tool_result payloads older than the last two
//!    turns are replaced by a compact placeholder, keeping the id.
//!
//! After dialogue folding may have removed declaring assistant messages,
//! [`synthesize_missing_declarations`] rebuilds minimal declarations so
//! every surviving result is preceded by its declaration.

use std::collections::{HashMap, HashSet};

use strand_domain::chat::{ChatContent, ChatMessage, ChatPart, ChatRole, ToolCall};
use strand_domain::text::truncate_runes;

/// Placeholder prefix for pruned payloads.
const COMPACTED_PREFIX: &str = "[tool_result_compacted]";
/// Preview length kept from a pruned payload, in runes.
const PRUNE_PREVIEW_RUNES: usize = 32;
/// Tool results within this many trailing turns keep their full payloads.
const KEEP_PAYLOAD_TURNS: usize = 2;

/// What hygiene changed, for the run event log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HygieneReport {
    pub orphan_tool_call_ids: Vec<String>,
    pub pruned_payloads: usize,
    pub synthesized_tool_call_ids: Vec<String>,
}

impl HygieneReport {
    pub fn is_clean(&self) -> bool {
        self.orphan_tool_call_ids.is_empty()
            && self.pruned_payloads == 0
            && self.synthesized_tool_call_ids.is_empty()
    }
}

/// Apply reference integrity then payload pruning. Returns the cleaned
/// history and a report of what changed.
pub fn apply_history_hygiene(messages: Vec<ChatMessage>) -> (Vec<ChatMessage>, HygieneReport) {
    let mut report = HygieneReport::default();

    // ── Pass 1: reference integrity ──────────────────────────────
    let mut declared: HashSet<String> = HashSet::new();
    let mut cleaned: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        let message = match message.content {
            ChatContent::Parts(parts) => {
                let mut kept = Vec::with_capacity(parts.len());
                for part in parts {
                    match &part {
                        ChatPart::ToolResult { tool_call_id, .. } => {
                            // Declarations only count from earlier messages.
                            if declared.contains(tool_call_id) {
                                kept.push(part);
                            } else {
                                report.orphan_tool_call_ids.push(tool_call_id.clone());
                            }
                        }
                        _ => kept.push(part),
                    }
                }
                // Register declarations after results were checked so a
                // same-message declaration is treated as out-of-order.
                for part in &kept {
                    if let ChatPart::ToolUse { id, .. } = part {
                        declared.insert(id.clone());
                    }
                }
                if kept.is_empty() {
                    continue;
                }
                ChatMessage {
                    role: message.role,
                    content: ChatContent::Parts(kept),
                }
            }
            content => ChatMessage {
                role: message.role,
                content,
            },
        };
        cleaned.push(message);
    }

    // ── Pass 2: payload pruning outside the last two turns ───────
    let user_positions: Vec<usize> = cleaned
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == ChatRole::User)
        .map(|(i, _)| i)
        .collect();
    if user_positions.len() > KEEP_PAYLOAD_TURNS {
        let boundary = user_positions[user_positions.len() - KEEP_PAYLOAD_TURNS];
        for message in &mut cleaned[..boundary] {
            if let ChatContent::Parts(parts) = &mut message.content {
                for part in parts {
                    if let ChatPart::ToolResult {
                        tool_call_id,
                        content,
                        ..
                    } = part
                    {
                        if content.starts_with(COMPACTED_PREFIX) {
                            continue;
                        }
                        let snippet = truncate_runes(content, PRUNE_PREVIEW_RUNES);
                        *content = format!(
                            "{COMPACTED_PREFIX} call_id={tool_call_id} preview: {snippet}"
                        );
                        report.pruned_payloads += 1;
                    }
                }
            }
        }
    }

    (cleaned, report)
}

/// Rebuild declarations for results whose declaring assistant message was
/// folded away. Runs *before* the orphan drop: only ids present in
/// `names` (calls the run actually knows about) are synthesized, so true
/// orphans still fall through to [`apply_history_hygiene`]. The minimal
/// assistant message is prepended immediately before each affected tool
/// message, preserving declaration-before-result order.
pub fn synthesize_missing_declarations(
    messages: Vec<ChatMessage>,
    names: &HashMap<String, String>,
) -> (Vec<ChatMessage>, Vec<String>) {
    let mut declared: HashSet<String> = HashSet::new();
    let mut synthesized = Vec::new();
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());

    for message in messages {
        let missing: Vec<String> = message
            .result_tool_call_ids()
            .into_iter()
            .filter(|id| !declared.contains(*id) && names.contains_key(*id))
            .map(String::from)
            .collect();
        if !missing.is_empty() {
            let calls: Vec<ToolCall> = missing
                .iter()
                .map(|id| ToolCall {
                    call_id: id.clone(),
                    tool_name: names.get(id).cloned().unwrap_or_else(|| "tool".into()),
                    arguments: serde_json::json!({}),
                })
                .collect();
            out.push(ChatMessage::assistant_with_tools("", &calls));
            declared.extend(missing.iter().cloned());
            synthesized.extend(missing);
        }
        for id in message.declared_tool_call_ids() {
            declared.insert(id.to_string());
        }
        out.push(message);
    }

    (out, synthesized)
}
