//! Prompt packing for the Strand runtime.
//!
//! Turns unbounded thread context (dialogue, evidence, memory, todos,
//! blockers, snapshots) into a bounded [`pack::PromptPack`] for one
//! provider call. When the assembled pack exceeds the token target the
//! [`compactor`] runs three staged reductions under a quality verifier;
//! [`hygiene`] keeps tool-call/tool-result reference integrity across the
//! provider history view.

pub mod compactor;
pub mod hygiene;
pub mod pack;
pub mod packer;
pub mod tokens;
