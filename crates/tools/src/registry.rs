//! Tool registry — name → (definition, handler).

use std::collections::HashMap;
use std::sync::Arc;

use strand_domain::chat::ToolDefinition;

use crate::tool::{ToolDef, ToolHandler};

#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its definition name. Later registrations
    /// replace earlier ones (skills may shadow builtins).
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.def().name.clone();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::debug!(tool = %name, "tool handler replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// All definitions, priority then name order.
    pub fn defs(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.handlers.values().map(|h| h.def().clone()).collect();
        defs.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.name.cmp(&b.name)));
        defs
    }

    /// Definitions in the provider shape, same ordering as [`defs`].
    pub fn llm_definitions(&self) -> Vec<ToolDefinition> {
        self.defs().iter().map(|d| d.to_llm_definition()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{ToolCtx, ToolResult, ToolSource};
    use strand_domain::error::Result;

    struct FakeTool {
        def: ToolDef,
    }

    impl FakeTool {
        fn named(name: &str, priority: i32) -> Arc<dyn ToolHandler> {
            Arc::new(Self {
                def: ToolDef {
                    name: name.into(),
                    description: "fake".into(),
                    schema: serde_json::json!({"type": "object"}),
                    parallel_safe: true,
                    mutating: false,
                    requires_approval: false,
                    source: ToolSource::Builtin,
                    namespace: "fake".into(),
                    priority,
                },
            })
        }
    }

    #[async_trait::async_trait]
    impl ToolHandler for FakeTool {
        fn def(&self) -> &ToolDef {
            &self.def
        }
        fn validate(&self, _args: &serde_json::Value) -> Result<()> {
            Ok(())
        }
        async fn execute(&self, _ctx: &ToolCtx, _args: serde_json::Value) -> ToolResult {
            ToolResult::success("ok", serde_json::Value::Null)
        }
    }

    #[test]
    fn defs_sorted_by_priority_then_name() {
        let mut registry = ToolRegistry::new();
        registry.register(FakeTool::named("zeta", 1));
        registry.register(FakeTool::named("alpha", 5));
        registry.register(FakeTool::named("beta", 1));

        let names: Vec<String> = registry.defs().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["beta", "zeta", "alpha"]);
    }

    #[test]
    fn later_registration_shadows() {
        let mut registry = ToolRegistry::new();
        registry.register(FakeTool::named("dup", 1));
        registry.register(FakeTool::named("dup", 9));
        assert_eq!(registry.defs().len(), 1);
        assert_eq!(registry.get("dup").unwrap().def().priority, 9);
    }
}
