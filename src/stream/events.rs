//! 对外事件：核心与 UI 之间唯一的数据边界
//!
//! 线上格式为 `{"event": "<类型>", "data": {...}}`，类型名为 kebab-case，字段为 camelCase。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::ApprovalRequest;
use crate::memory::Todo;

/// 委派状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Pending,
    Running,
    Complete,
    Error,
}

impl DispatchStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, DispatchStatus::Complete | DispatchStatus::Error)
    }
}

/// 一次子智能体委派；id 即编排器发出的 task 调用 id（外部 id）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentDispatch {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: DispatchStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: String,
    },
    SubagentStart {
        id: String,
        name: String,
        description: String,
        status: DispatchStatus,
        started_at: DateTime<Utc>,
    },
    SubagentDelta {
        tool_call_id: String,
        text: String,
    },
    SubagentTool {
        tool_call_id: String,
        tool_name: String,
        result: String,
    },
    SubagentComplete {
        id: String,
        status: DispatchStatus,
        completed_at: DateTime<Utc>,
        result: String,
    },
    TodoUpdate {
        todos: Vec<Todo>,
    },
    ApprovalRequired(ApprovalRequest),
    Error {
        message: String,
    },
    Done {
        thread_id: String,
    },
}

impl StreamEvent {
    /// 事件类型名（SSE 的 `event:` 行）
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::TextDelta { .. } => "text-delta",
            StreamEvent::ToolCall { .. } => "tool-call",
            StreamEvent::ToolResult { .. } => "tool-result",
            StreamEvent::SubagentStart { .. } => "subagent-start",
            StreamEvent::SubagentDelta { .. } => "subagent-delta",
            StreamEvent::SubagentTool { .. } => "subagent-tool",
            StreamEvent::SubagentComplete { .. } => "subagent-complete",
            StreamEvent::TodoUpdate { .. } => "todo-update",
            StreamEvent::ApprovalRequired(_) => "approval-required",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done { .. } => "done",
        }
    }

    /// `data` 部分的 JSON
    pub fn data(&self) -> serde_json::Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|mut v| v.get_mut("data").map(serde_json::Value::take))
            .unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let ev = StreamEvent::ToolCall {
            tool_call_id: "c1".into(),
            tool_name: "execute_command".into(),
            args: json!({"command": "df -h"}),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "tool-call");
        assert_eq!(v["data"]["toolCallId"], "c1");
        assert_eq!(v["data"]["toolName"], "execute_command");
        assert_eq!(ev.name(), "tool-call");
        assert_eq!(ev.data()["args"]["command"], "df -h");

        let done = serde_json::to_value(StreamEvent::Done { thread_id: "t1".into() }).unwrap();
        assert_eq!(done, json!({"event": "done", "data": {"threadId": "t1"}}));
    }

    #[test]
    fn test_names_match_serialized_tags() {
        let events = vec![
            StreamEvent::TextDelta { text: "hi".into() },
            StreamEvent::TodoUpdate { todos: vec![] },
            StreamEvent::Error { message: "boom".into() },
        ];
        for ev in events {
            let v = serde_json::to_value(&ev).unwrap();
            assert_eq!(v["event"], ev.name());
        }
    }
}
