//! Interfaces to external collaborators the core consumes but does not
//! implement: upload storage and long-term memory retrieval. The skill
//! catalog and patch applier interfaces live in `strand-tools` next to
//! the handlers that consume them.

use strand_domain::context::MemoryItem;
use strand_domain::error::Result;

/// Metadata about one stored upload, resolved best-effort while building
/// the user message payload.
#[derive(Debug, Clone)]
pub struct UploadMeta {
    pub upload_id: String,
    pub name: String,
    pub media_type: Option<String>,
    pub size_bytes: Option<u64>,
}

/// Upload storage collaborator.
#[async_trait::async_trait]
pub trait UploadStore: Send + Sync {
    /// `None` when the upload id is unknown; never an error for the caller.
    async fn resolve(&self, upload_id: &str) -> Option<UploadMeta>;
}

/// Long-term memory retrieval plugin consulted by the prompt packer.
#[async_trait::async_trait]
pub trait MemoryRetriever: Send + Sync {
    async fn retrieve(&self, thread_id: &str, query: &str, limit: usize)
        -> Result<Vec<MemoryItem>>;
}
