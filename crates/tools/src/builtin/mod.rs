//! Built-in tools.
//!
//! Everything the runtime ships out of the box: workspace mutation
//! (`apply_patch`), command execution (`terminal.exec`), the thread TODO
//! snapshot (`write_todos`), read-only discovery (`web.search`,
//! `knowledge.search`), skill activation (`use_skill`), and the signal
//! tools (`task_complete`, `ask_user`). The `subagents` tool is registered
//! by the engine, which owns the subagent manager.

pub mod patch;
pub mod search;
pub mod signals;
pub mod skill;
pub mod terminal;
pub mod todos;

use std::sync::Arc;

use crate::registry::ToolRegistry;

/// Register every builtin that has no engine dependency.
pub fn register_builtins(
    registry: &mut ToolRegistry,
    patch_applier: Option<Arc<dyn patch::PatchApplier>>,
    todo_store: Arc<dyn todos::TodoStore>,
    search_backend: Option<Arc<dyn search::SearchBackend>>,
    skill_catalog: Option<Arc<dyn skill::SkillCatalog>>,
) {
    registry.register(Arc::new(patch::ApplyPatchTool::new(patch_applier)));
    registry.register(Arc::new(terminal::TerminalExecTool::new()));
    registry.register(Arc::new(todos::WriteTodosTool::new(todo_store)));
    registry.register(Arc::new(search::SearchTool::web(search_backend.clone())));
    registry.register(Arc::new(search::SearchTool::knowledge(search_backend)));
    registry.register(Arc::new(skill::UseSkillTool::new(skill_catalog)));
    registry.register(Arc::new(signals::TaskCompleteTool::new()));
    registry.register(Arc::new(signals::AskUserTool::new()));
}
