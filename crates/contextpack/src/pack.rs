//! The Prompt Pack — the bounded, quality-verified bundle handed to a
//! provider call. Immutable once handed over; the packer and compactor are
//! the only writers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use strand_domain::chat::ChatMessage;
use strand_domain::context::{ConversationTurn, ExecutionSpan, MemoryItem};

use crate::tokens;

/// One attachment manifest line (name, type, size — already resolved).
pub type AttachmentLine = String;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptPack {
    /// The system contract: role, rules of engagement, tool etiquette.
    pub system_contract: String,
    /// The thread's current objective ("open goal"). Preserved verbatim by
    /// compaction.
    pub objective: String,
    /// Active constraints. Every one must survive compaction.
    pub constraints: Vec<String>,
    /// Recent dialogue turns, chronological.
    pub dialogue: Vec<ConversationTurn>,
    /// Execution evidence spans, chronological.
    pub evidence: Vec<ExecutionSpan>,
    /// Pending TODO lines.
    pub pending_todos: Vec<String>,
    /// Active blocker lines.
    pub blockers: Vec<String>,
    /// Retrieved long-term memory items, relevance order.
    pub memory: Vec<MemoryItem>,
    /// Attachment manifest lines.
    pub attachments: Vec<AttachmentLine>,
    /// Rolling thread snapshot (episode folds get appended here).
    pub thread_snapshot: String,

    // ── Stamped by packer / compactor ────────────────────────────
    pub estimated_input_tokens: u64,
    pub compression_saving_ratio: f64,
    pub compression_quality_pass: bool,
    pub section_tokens: BTreeMap<String, u64>,
}

impl PromptPack {
    /// Recompute per-section token usage and the total estimate.
    pub fn recompute_tokens(&mut self) {
        let mut sections = BTreeMap::new();
        sections.insert("system_contract".into(), tokens::estimate_section(&self.system_contract));
        sections.insert("objective".into(), tokens::estimate_section(&self.objective));
        sections.insert(
            "constraints".into(),
            tokens::estimate_lines(self.constraints.iter().map(|s| s.as_str())),
        );
        let dialogue_runes: String = self
            .dialogue
            .iter()
            .map(|t| format!("{}\n{}\n", t.user_text, t.assistant_text))
            .collect();
        sections.insert("dialogue".into(), tokens::estimate_section(&dialogue_runes));
        let evidence_runes: String = self
            .evidence
            .iter()
            .map(|e| format!("{} {}\n", e.summary, e.payload_json))
            .collect();
        sections.insert("evidence".into(), tokens::estimate_section(&evidence_runes));
        sections.insert(
            "pending_todos".into(),
            tokens::estimate_lines(self.pending_todos.iter().map(|s| s.as_str())),
        );
        sections.insert(
            "blockers".into(),
            tokens::estimate_lines(self.blockers.iter().map(|s| s.as_str())),
        );
        sections.insert(
            "memory".into(),
            tokens::estimate_lines(self.memory.iter().map(|m| m.content.as_str())),
        );
        sections.insert(
            "attachments".into(),
            tokens::estimate_lines(self.attachments.iter().map(|s| s.as_str())),
        );
        sections.insert(
            "thread_snapshot".into(),
            tokens::estimate_section(&self.thread_snapshot),
        );

        self.estimated_input_tokens = sections.values().sum();
        self.section_tokens = sections;
    }

    /// Render the pack as provider messages: one system message with the
    /// packed sections, then the recent dialogue as user/assistant turns.
    pub fn render_messages(&self) -> Vec<ChatMessage> {
        let mut system = String::new();
        system.push_str(&self.system_contract);

        if !self.objective.is_empty() {
            system.push_str("\n\n## Objective\n");
            system.push_str(&self.objective);
        }
        if !self.constraints.is_empty() {
            system.push_str("\n\n## Active constraints\n");
            for c in &self.constraints {
                system.push_str(&format!("- {c}\n"));
            }
        }
        if !self.thread_snapshot.is_empty() {
            system.push_str("\n\n## Thread snapshot\n");
            system.push_str(&self.thread_snapshot);
        }
        if !self.evidence.is_empty() {
            system.push_str("\n\n## Recent execution evidence\n");
            for e in &self.evidence {
                system.push_str(&format!("- [{}] {} {}\n", e.span_id, e.kind, e.summary));
            }
        }
        if !self.pending_todos.is_empty() {
            system.push_str("\n\n## Pending todos\n");
            for t in &self.pending_todos {
                system.push_str(&format!("- {t}\n"));
            }
        }
        if !self.blockers.is_empty() {
            system.push_str("\n\n## Blockers\n");
            for b in &self.blockers {
                system.push_str(&format!("- {b}\n"));
            }
        }
        if !self.memory.is_empty() {
            system.push_str("\n\n## Relevant memory\n");
            for m in &self.memory {
                system.push_str(&format!("- ({}) {}\n", m.kind.as_str(), m.content));
            }
        }
        if !self.attachments.is_empty() {
            system.push_str("\n\n## Attachments\n");
            for a in &self.attachments {
                system.push_str(&format!("- {a}\n"));
            }
        }

        let mut messages = vec![ChatMessage::system(system)];
        for turn in &self.dialogue {
            messages.push(ChatMessage::user(&turn.user_text));
            if !turn.is_pending() {
                messages.push(ChatMessage::assistant(&turn.assistant_text));
            }
        }
        messages
    }
}
