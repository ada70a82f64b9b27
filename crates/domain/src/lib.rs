//! Shared domain types for the Strand agent runtime.
//!
//! Everything that crosses a crate boundary lives here: thread/run/message
//! records, the run state machine, normalized provider stream events, tool
//! call records, provider capabilities, the error taxonomy, and the TOML
//! configuration tree.

pub mod capability;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod run;
pub mod stream;
pub mod text;
pub mod thread;
