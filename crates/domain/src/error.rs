//! Shared error type used across all Strand crates.
//!
//! Caller-visible sentinels (conflict, permission, lock violations) are
//! dedicated variants so call sites can match on them without string
//! comparison. Everything else is wrapped with enough context to debug.

/// Shared error type used across all Strand crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store: {0}")]
    Store(String),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    /// The provider rejected the request because a tool_result referenced a
    /// tool_call_id it could not find. Recoverable via history hygiene.
    #[error("provider {provider}: tool call reference error: {message}")]
    ProviderToolCallReference { provider: String, message: String },

    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("config: {0}")]
    Config(String),

    // ── Caller-visible sentinels ─────────────────────────────────
    #[error("service is not configured")]
    NotConfigured,

    #[error("thread is busy with another run")]
    ThreadBusy,

    #[error("active run changed since the request was issued")]
    RunChanged,

    #[error("waiting prompt changed since the request was issued")]
    WaitingPromptChanged,

    #[error("thread model is locked")]
    ModelLockViolation,

    #[error("switching the model of a locked thread requires an explicit restart")]
    ModelSwitchRequiresExplicitRestart,

    #[error("read permission denied")]
    ReadPermissionDenied,

    #[error("read-write-execute permission denied")]
    RwxPermissionDenied,

    #[error("thread todos snapshot version conflict: expected {expected}, current {current}")]
    ThreadTodosVersionConflict { expected: u64, current: u64 },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for the conflict sentinels that must abort before any persistence.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::RunChanged
                | Error::WaitingPromptChanged
                | Error::ThreadTodosVersionConflict { .. }
        )
    }

    /// True when the run engine may retry once after rerunning history hygiene.
    pub fn is_tool_call_reference(&self) -> bool {
        matches!(self, Error::ProviderToolCallReference { .. })
    }

    /// True for transient provider/tool failures eligible for one self-recovery
    /// retry per turn.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::Timeout(_) | Error::Provider { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_sentinels() {
        assert!(Error::RunChanged.is_conflict());
        assert!(Error::WaitingPromptChanged.is_conflict());
        assert!(Error::ThreadTodosVersionConflict {
            expected: 1,
            current: 2
        }
        .is_conflict());
        assert!(!Error::NotConfigured.is_conflict());
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Http("connection reset".into()).is_transient());
        assert!(Error::Timeout("provider call".into()).is_transient());
        assert!(!Error::ModelLockViolation.is_transient());
    }

    #[test]
    fn tool_call_reference_classification() {
        let err = Error::ProviderToolCallReference {
            provider: "openai".into(),
            message: "tool_call_id is not found".into(),
        };
        assert!(err.is_tool_call_reference());
        assert!(!err.is_transient());
    }
}
