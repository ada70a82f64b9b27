//! Tool registry and built-in handlers for the Strand runtime.
//!
//! A tool is a [`tool::ToolDef`] (schema + dispatch flags) plus a
//! [`tool::ToolHandler`] (validate, execute, partial streaming). The
//! [`registry::ToolRegistry`] maps names to handlers; the engine consults
//! the def flags for approval gating and parallel dispatch.

pub mod builtin;
pub mod registry;
pub mod tool;
pub mod truncate;

pub use registry::ToolRegistry;
pub use tool::{
    LifecycleSink, NullSink, ToolCtx, ToolDef, ToolHandler, ToolResult, ToolSource, ToolStatus,
};
