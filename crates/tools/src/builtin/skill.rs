//! `use_skill` — activate a skill by name.
//!
//! Skill storage and import are external; the handler resolves names
//! through a [`SkillCatalog`] and returns the skill body plus optional
//! mode hints.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use strand_domain::error::{Error, Result};

use crate::tool::{codes, ToolCtx, ToolDef, ToolHandler, ToolResult, ToolSource};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub mode_hints: Vec<String>,
}

/// External skill collaborator.
pub trait SkillCatalog: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Skill>;
    fn list_names(&self) -> Vec<String>;
}

pub struct UseSkillTool {
    def: ToolDef,
    catalog: Option<Arc<dyn SkillCatalog>>,
}

impl UseSkillTool {
    pub fn new(catalog: Option<Arc<dyn SkillCatalog>>) -> Self {
        Self {
            def: ToolDef {
                name: "use_skill".into(),
                description: "Activate a skill by name and load its instructions.".into(),
                schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "name": { "type": "string", "description": "Skill name" }
                    },
                    "required": ["name"]
                }),
                parallel_safe: true,
                mutating: false,
                requires_approval: false,
                source: ToolSource::Builtin,
                namespace: "skills".into(),
                priority: 50,
            },
            catalog,
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for UseSkillTool {
    fn def(&self) -> &ToolDef {
        &self.def
    }

    fn validate(&self, args: &serde_json::Value) -> Result<()> {
        let name = args.get("name").and_then(|v| v.as_str()).unwrap_or("");
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument("skill name must not be empty".into()));
        }
        Ok(())
    }

    async fn execute(&self, _ctx: &ToolCtx, args: serde_json::Value) -> ToolResult {
        let Some(catalog) = &self.catalog else {
            return ToolResult::error(codes::NOT_CONFIGURED, "no skill catalog configured");
        };
        let name = args
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        match catalog.lookup(name) {
            Some(skill) => ToolResult::success(
                format!("skill {} activated", skill.name),
                serde_json::to_value(&skill).unwrap_or(serde_json::Value::Null),
            ),
            None => {
                let known = catalog.list_names().join(", ");
                ToolResult::error(
                    codes::INVALID_ARGS,
                    format!("unknown skill '{name}'; available: {known}"),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolStatus;
    use uuid::Uuid;

    struct FakeCatalog;

    impl SkillCatalog for FakeCatalog {
        fn lookup(&self, name: &str) -> Option<Skill> {
            (name == "release-notes").then(|| Skill {
                name: name.into(),
                content: "# Release notes\nDo the thing.".into(),
                mode_hints: vec!["concise".into()],
            })
        }
        fn list_names(&self) -> Vec<String> {
            vec!["release-notes".into()]
        }
    }

    #[tokio::test]
    async fn returns_skill_content() {
        let tool = UseSkillTool::new(Some(Arc::new(FakeCatalog)));
        let ctx = ToolCtx::test(Uuid::new_v4(), "tc");
        let result = tool
            .execute(&ctx, serde_json::json!({"name": "release-notes"}))
            .await;
        assert_eq!(result.status, ToolStatus::Success);
        assert!(result.data["content"].as_str().unwrap().contains("Do the thing"));
        assert_eq!(result.data["mode_hints"][0], "concise");
    }

    #[tokio::test]
    async fn unknown_skill_lists_available() {
        let tool = UseSkillTool::new(Some(Arc::new(FakeCatalog)));
        let ctx = ToolCtx::test(Uuid::new_v4(), "tc");
        let result = tool
            .execute(&ctx, serde_json::json!({"name": "nope"}))
            .await;
        assert_eq!(result.status, ToolStatus::Error);
        assert!(result.summary.contains("release-notes"));
    }
}
