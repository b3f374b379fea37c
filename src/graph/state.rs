//! 执行状态与部分更新
//!
//! 节点只返回 `StateUpdate`，由引擎在每步之后逐字段合并；每个字段有自己的合并函数：
//! - messages：追加，超过上限时从最旧的组开始裁剪（不拆开工具调用与结果，首条消息保留）
//! - plan / todos / is_complete / next_action：替换
//! - iteration_count：累加
//! - tool_results：环形缓冲，仅保留最近 N 条

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::memory::window::group_ranges;
use crate::memory::{pending_tool_calls, Message, Role, Todo, ToolCall, ToolResult};

/// 状态容量上限
#[derive(Debug, Clone, Copy)]
pub struct StateLimits {
    pub max_messages: usize,
    pub max_tool_results: usize,
}

impl Default for StateLimits {
    fn default() -> Self {
        Self {
            max_messages: 200,
            max_tool_results: 50,
        }
    }
}

/// 贯穿各节点的工作状态
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub messages: Vec<Message>,
    pub plan: Vec<String>,
    pub iteration_count: usize,
    pub todos: Vec<Todo>,
    pub tool_results: VecDeque<ToolResult>,
    pub is_complete: bool,
    /// 反思给出的下一步指示（批判意见）
    pub next_action: Option<String>,
}

/// 节点产出的部分更新；None 表示不修改该字段
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateUpdate {
    pub messages: Option<Vec<Message>>,
    pub plan: Option<Vec<String>>,
    pub todos: Option<Vec<Todo>>,
    pub tool_results: Option<Vec<ToolResult>>,
    pub is_complete: Option<bool>,
    /// Some(None) 表示清空
    pub next_action: Option<Option<String>>,
}

impl StateUpdate {
    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn plan(mut self, plan: Vec<String>) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn todos(mut self, todos: Vec<Todo>) -> Self {
        self.todos = Some(todos);
        self
    }

    pub fn tool_results(mut self, results: Vec<ToolResult>) -> Self {
        self.tool_results = Some(results);
        self
    }

    pub fn complete(mut self, is_complete: bool) -> Self {
        self.is_complete = Some(is_complete);
        self
    }

    pub fn next_action(mut self, action: Option<String>) -> Self {
        self.next_action = Some(action);
        self
    }
}

impl ExecutionState {
    /// 以一条用户输入开启新状态
    pub fn with_input(input: Message) -> Self {
        Self {
            messages: vec![input],
            ..Self::default()
        }
    }

    /// 在已有历史上开始新一轮：保留消息、待办与工具结果，重置本轮计数与标志
    pub fn begin_turn(&mut self, input: Message, limits: &StateLimits) {
        self.plan.clear();
        self.iteration_count = 0;
        self.is_complete = false;
        self.next_action = None;
        self.merge_messages(vec![input], limits.max_messages);
    }

    /// 逐字段合并节点更新
    pub fn apply(&mut self, update: StateUpdate, limits: &StateLimits) {
        if let Some(messages) = update.messages {
            self.merge_messages(messages, limits.max_messages);
        }
        if let Some(plan) = update.plan {
            self.merge_plan(plan);
        }
        if let Some(todos) = update.todos {
            self.merge_todos(todos);
        }
        if let Some(results) = update.tool_results {
            self.merge_tool_results(results, limits.max_tool_results);
        }
        if let Some(done) = update.is_complete {
            self.merge_is_complete(done);
        }
        if let Some(action) = update.next_action {
            self.merge_next_action(action);
        }
    }

    /// 追加后按组裁剪最旧的消息；首条消息与最后一组始终保留
    pub fn merge_messages(&mut self, new: Vec<Message>, max_messages: usize) {
        self.messages.extend(new);
        if max_messages == 0 || self.messages.len() <= max_messages {
            return;
        }
        let groups = group_ranges(&self.messages);
        let mut excess = self.messages.len() - max_messages;
        let mut cut = None;
        for g in groups.iter().skip(1).take(groups.len().saturating_sub(2)) {
            if excess == 0 {
                break;
            }
            excess = excess.saturating_sub(g.len());
            cut = Some(g.end);
        }
        if let Some(end) = cut {
            self.messages.drain(1..end);
        }
    }

    pub fn merge_plan(&mut self, plan: Vec<String>) {
        self.plan = plan;
    }

    pub fn merge_iteration(&mut self, delta: usize) {
        self.iteration_count += delta;
    }

    pub fn merge_todos(&mut self, todos: Vec<Todo>) {
        self.todos = todos;
    }

    pub fn merge_tool_results(&mut self, results: Vec<ToolResult>, cap: usize) {
        for r in results {
            self.tool_results.push_back(r);
        }
        while cap > 0 && self.tool_results.len() > cap {
            self.tool_results.pop_front();
        }
    }

    pub fn merge_is_complete(&mut self, done: bool) {
        self.is_complete = done;
    }

    pub fn merge_next_action(&mut self, action: Option<String>) {
        self.next_action = action;
    }

    /// 最后一条 assistant 消息中尚未得到结果的工具调用
    pub fn pending_calls(&self) -> Vec<ToolCall> {
        pending_tool_calls(&self.messages)
    }

    /// 最后一条非空 assistant 文本
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && !m.content.trim().is_empty())
            .map(|m| m.content.as_str())
    }

    /// 最近一条用户输入之后是否已有工具结果
    pub fn tools_used_this_turn(&self) -> bool {
        let start = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(0);
        self.messages[start..].iter().any(|m| m.role == Role::Tool)
    }

    /// 最近一条用户输入
    pub fn last_user_input(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limits(max_messages: usize, max_tool_results: usize) -> StateLimits {
        StateLimits {
            max_messages,
            max_tool_results,
        }
    }

    #[test]
    fn test_tool_results_ring_buffer() {
        let mut state = ExecutionState::default();
        let results: Vec<ToolResult> = (0..5)
            .map(|i| ToolResult::new(format!("c{i}"), "ls", "ok"))
            .collect();
        state.apply(StateUpdate::default().tool_results(results), &limits(100, 3));
        let ids: Vec<_> = state.tool_results.iter().map(|r| r.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c3", "c4"]);
    }

    #[test]
    fn test_message_trim_keeps_first_and_pairs() {
        let mut state = ExecutionState::with_input(Message::user("original task"));
        for i in 0..4 {
            let id = format!("c{i}");
            state.merge_messages(
                vec![
                    Message::assistant_with_calls("", vec![ToolCall::new(&id, "ls", json!({}))]),
                    Message::tool(&id, "ok"),
                ],
                5,
            );
        }
        assert_eq!(state.messages[0].content, "original task");
        assert!(state.messages.len() <= 5);
        // 第二条必须是 assistant（结果没有与调用分离）
        assert_eq!(state.messages[1].role, Role::Assistant);
        assert_eq!(state.messages.last().unwrap().tool_call_id.as_deref(), Some("c3"));
    }

    #[test]
    fn test_replace_fields() {
        let mut state = ExecutionState::default();
        state.apply(
            StateUpdate::default()
                .plan(vec!["a".into(), "b".into()])
                .complete(true)
                .next_action(Some("tighten the answer".into())),
            &StateLimits::default(),
        );
        state.apply(StateUpdate::default().plan(vec!["c".into()]), &StateLimits::default());
        assert_eq!(state.plan, vec!["c".to_string()]);
        assert!(state.is_complete);
        state.apply(StateUpdate::default().next_action(None), &StateLimits::default());
        assert!(state.next_action.is_none());
    }

    #[test]
    fn test_begin_turn_resets_counters() {
        let mut state = ExecutionState::with_input(Message::user("first"));
        state.merge_iteration(7);
        state.merge_is_complete(true);
        state.begin_turn(Message::user("second"), &StateLimits::default());
        assert_eq!(state.iteration_count, 0);
        assert!(!state.is_complete);
        assert_eq!(state.last_user_input(), Some("second"));
        assert_eq!(state.messages.len(), 2);
    }
}
