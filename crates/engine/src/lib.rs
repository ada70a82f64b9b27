//! The Strand run engine.
//!
//! Ties the stores, prompt packer, provider adapters, and tool registry
//! into one service: per-thread actors serialize mutations, runs drive the
//! bounded turn loop, approvals gate mutating tools, and every run leaves
//! an authoritative event trail behind the best-effort stream.

pub mod actor;
pub mod collaborators;
pub mod service;
pub mod sidecar;
pub mod state;

pub mod runtime;

pub use service::{Service, UserTurnAck, UserTurnRequest};
pub use state::{EngineState, SessionPermissions};
