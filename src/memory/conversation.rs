//! 对话数据模型：消息、工具调用、工具结果、待办
//!
//! 消息一旦追加即不可变，顺序即追加顺序；ToolCall.id 是与后续 ToolResult 配对的关联键。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息角色（与模型 API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            _ => Role::System,
        }
    }
}

/// 模型发出的工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// 工具执行结果；成功与失败都以字符串载荷回填给模型
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub output: String,
    pub truncated: bool,
}

impl ToolResult {
    pub fn new(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            output: output.into(),
            truncated: false,
        }
    }

    /// 失败结果：以 "Error: " 前缀区分，不走独立通道
    pub fn error(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::new(tool_call_id, tool_name, format!("Error: {reason}"))
    }

    pub fn is_error(&self) -> bool {
        self.output.starts_with("Error:")
    }

    /// 转为回填上下文的 tool 消息
    pub fn to_message(&self) -> Message {
        Message::tool(self.tool_call_id.clone(), self.output.clone())
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// 携带工具调用的 assistant 消息
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.tool_calls = calls;
        msg
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// 待办状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

/// 智能体在一次运行中维护的、对用户可见的任务项
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Todo {
    pub content: String,
    pub status: TodoStatus,
}

/// 最后一条 assistant 消息中尚无结果的工具调用（按调用顺序）
pub fn pending_tool_calls(messages: &[Message]) -> Vec<ToolCall> {
    let Some(idx) = messages.iter().rposition(|m| m.role == Role::Assistant) else {
        return Vec::new();
    };
    let answered: std::collections::HashSet<&str> = messages[idx + 1..]
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    messages[idx]
        .tool_calls
        .iter()
        .filter(|c| !answered.contains(c.id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pending_tool_calls() {
        let messages = vec![
            Message::user("check disks"),
            Message::assistant_with_calls(
                "",
                vec![
                    ToolCall::new("c1", "execute_command", json!({"command": "df -h"})),
                    ToolCall::new("c2", "execute_command", json!({"command": "du -sh /var"})),
                ],
            ),
            Message::tool("c1", "Filesystem ..."),
        ];
        let pending = pending_tool_calls(&messages);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "c2");
    }

    #[test]
    fn test_message_serializes_camel_case() {
        let msg = Message::tool("c1", "ok");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["toolCallId"], "c1");
        assert_eq!(v["role"], "tool");
        assert!(v.get("toolCalls").is_none());
    }

    #[test]
    fn test_error_result_is_distinguishable_by_content() {
        let r = ToolResult::error("c1", "execute_command", "exit 2");
        assert!(r.is_error());
        assert!(!ToolResult::new("c1", "ls", "a b c").is_error());
    }
}
