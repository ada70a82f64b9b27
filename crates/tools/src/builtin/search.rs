//! `web.search` and `knowledge.search` — read-only discovery tools.
//!
//! Both are parallel safe and share one backend interface. Without a
//! backend wired in they answer with a structured unavailability error and
//! a workaround suggestion.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use strand_domain::error::{Error, Result};

use crate::tool::{codes, ToolCtx, ToolDef, ToolHandler, ToolResult, ToolSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Web,
    Knowledge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// External search collaborator.
#[async_trait::async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, kind: SearchKind, query: &str, limit: usize)
        -> Result<Vec<SearchHit>>;
}

pub struct SearchTool {
    def: ToolDef,
    kind: SearchKind,
    backend: Option<Arc<dyn SearchBackend>>,
}

impl SearchTool {
    pub fn web(backend: Option<Arc<dyn SearchBackend>>) -> Self {
        Self::new(SearchKind::Web, "web.search", "Search the web.", backend)
    }

    pub fn knowledge(backend: Option<Arc<dyn SearchBackend>>) -> Self {
        Self::new(
            SearchKind::Knowledge,
            "knowledge.search",
            "Search the internal knowledge base.",
            backend,
        )
    }

    fn new(
        kind: SearchKind,
        name: &str,
        description: &str,
        backend: Option<Arc<dyn SearchBackend>>,
    ) -> Self {
        Self {
            def: ToolDef {
                name: name.into(),
                description: description.into(),
                schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Search query" },
                        "limit": { "type": "integer", "description": "Max results (default 8)" }
                    },
                    "required": ["query"]
                }),
                parallel_safe: true,
                mutating: false,
                requires_approval: false,
                source: ToolSource::Builtin,
                namespace: name.split('.').next().unwrap_or("search").into(),
                priority: 40,
            },
            kind,
            backend,
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for SearchTool {
    fn def(&self) -> &ToolDef {
        &self.def
    }

    fn validate(&self, args: &serde_json::Value) -> Result<()> {
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("");
        if query.trim().is_empty() {
            return Err(Error::InvalidArgument("query must not be empty".into()));
        }
        Ok(())
    }

    async fn execute(&self, _ctx: &ToolCtx, args: serde_json::Value) -> ToolResult {
        let Some(backend) = &self.backend else {
            return ToolResult::error(
                codes::NOT_CONFIGURED,
                format!(
                    "{} is not configured; use terminal.exec with a CLI search as a workaround",
                    self.def.name
                ),
            );
        };
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(8)
            .clamp(1, 25) as usize;

        match backend.search(self.kind, query, limit).await {
            Ok(hits) => ToolResult::success(
                format!("{} results", hits.len()),
                serde_json::json!({ "hits": hits }),
            ),
            Err(e) => ToolResult::error(codes::EXEC_FAILED, e.to_string()),
        }
    }
}
