//! 引擎内置工具：write_todos（维护待办列表）与 task（委派给子智能体）
//!
//! 这两个工具修改的是执行状态或执行图本身，因此不经过 ToolExecutor，由 tools 节点直接处理；
//! 这里只提供它们的参数类型与 schema。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::SubagentEntry;
use crate::core::AgentError;
use crate::memory::Todo;
use crate::tools::ToolInfo;

pub const WRITE_TODOS: &str = "write_todos";
pub const TASK: &str = "task";

/// write_todos 参数：完整替换当前待办列表
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WriteTodosArgs {
    pub todos: Vec<Todo>,
}

/// task 参数：委派的子智能体名与任务描述
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskArgs {
    /// 子智能体名称
    pub name: String,
    /// 交给子智能体的完整任务说明
    pub description: String,
}

fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null)
}

pub fn write_todos_info() -> ToolInfo {
    ToolInfo::new(
        WRITE_TODOS,
        "Replace the visible todo list for this run. Send the full list every time.",
        schema_value::<WriteTodosArgs>(),
    )
}

/// task 工具描述中列出可委派的子智能体
pub fn task_info(subagents: &[SubagentEntry]) -> ToolInfo {
    let roster = subagents
        .iter()
        .map(|s| format!("- {}: {}", s.name, s.description))
        .collect::<Vec<_>>()
        .join("\n");
    ToolInfo::new(
        TASK,
        format!("Delegate a self-contained task to a subagent. Available subagents:\n{roster}"),
        schema_value::<TaskArgs>(),
    )
}

pub fn parse_todos(args: &Value) -> Result<Vec<Todo>, AgentError> {
    serde_json::from_value::<WriteTodosArgs>(args.clone())
        .map(|a| a.todos)
        .map_err(|e| AgentError::ToolExecution(format!("invalid write_todos arguments: {e}")))
}

pub fn parse_task(args: &Value) -> Result<TaskArgs, AgentError> {
    serde_json::from_value(args.clone())
        .map_err(|e| AgentError::ToolExecution(format!("invalid task arguments: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::TodoStatus;

    #[test]
    fn test_parse_todos() {
        let todos = parse_todos(&serde_json::json!({
            "todos": [
                {"content": "check nodes", "status": "completed"},
                {"content": "drain node-3", "status": "in_progress"}
            ]
        }))
        .unwrap();
        assert_eq!(todos.len(), 2);
        assert_eq!(todos[1].status, TodoStatus::InProgress);
        assert!(parse_todos(&serde_json::json!({"todos": "nope"})).is_err());
    }

    #[test]
    fn test_task_info_lists_subagents() {
        let info = task_info(&[SubagentEntry {
            name: "k8s-inspector".into(),
            description: "Reads cluster state".into(),
            system_prompt: None,
            tools: vec![],
        }]);
        assert!(info.description.contains("k8s-inspector"));
        assert_eq!(info.json_schema["required"].as_array().unwrap().len(), 2);
    }
}
