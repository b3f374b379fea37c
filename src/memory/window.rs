//! 上下文窗口：每次调用模型前裁剪并修复消息历史
//!
//! 裁剪以「组」为单位：一条普通消息自成一组；带工具调用的 assistant 消息与其后紧跟的 tool 消息为一组，
//! 组内消息要么一起保留要么一起丢弃。`sanitize_tool_pairs` 独立于裁剪，在裁剪之后运行，
//! 保证发给模型的每个工具调用都恰好有一条结果紧随其后。

use std::ops::Range;

use crate::memory::{Message, Role};

/// 未得到结果的工具调用所补的占位输出
pub const MISSING_RESULT_PLACEHOLDER: &str =
    "Error: tool call was interrupted before producing a result";

const SYNTHETIC_ACK: &str = "Acknowledged.";
const SYNTHETIC_CONTINUE: &str = "Continue.";

/// 将消息序列切分为组（返回下标区间，按原顺序）
pub fn group_ranges(messages: &[Message]) -> Vec<Range<usize>> {
    let mut groups = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        let start = i;
        i += 1;
        if messages[start].role == Role::Assistant && messages[start].has_tool_calls() {
            while i < messages.len() && messages[i].role == Role::Tool {
                i += 1;
            }
        }
        groups.push(start..i);
    }
    groups
}

/// 上下文窗口管理器
#[derive(Debug, Clone)]
pub struct ContextWindowManager {
    max_groups: usize,
}

impl ContextWindowManager {
    pub fn new(max_groups: usize) -> Self {
        Self {
            max_groups: max_groups.max(1),
        }
    }

    pub fn max_groups(&self) -> usize {
        self.max_groups
    }

    /// 生成有界且结构合法的消息切片
    ///
    /// 1. 丢弃空内容消息（携带工具调用的 assistant 与 tool 结果除外）
    /// 2. 从尾部向前按组选取，最多 max_groups 组
    /// 3. 第一组（原始任务）始终保留，可因此多出一组
    /// 4. 相邻同角色的 user / assistant 之间插入最小的合成轮次
    pub fn apply(&self, messages: &[Message]) -> Vec<Message> {
        let kept: Vec<&Message> = messages
            .iter()
            .filter(|m| {
                !m.content.trim().is_empty() || m.has_tool_calls() || m.role == Role::Tool
            })
            .collect();
        if kept.is_empty() {
            return Vec::new();
        }
        let owned: Vec<Message> = kept.into_iter().cloned().collect();

        // 以 tool 消息开头的组是孤儿结果，其调用已不在历史中
        let groups: Vec<Range<usize>> = group_ranges(&owned)
            .into_iter()
            .filter(|g| owned[g.start].role != Role::Tool)
            .collect();
        let Some((first, rest)) = groups.split_first() else {
            return Vec::new();
        };

        let tail_start = rest.len().saturating_sub(self.max_groups);
        let mut selected: Vec<Message> = owned[first.clone()].to_vec();
        for group in &rest[tail_start..] {
            selected.extend_from_slice(&owned[group.clone()]);
        }
        if tail_start > 0 {
            tracing::debug!(
                dropped_groups = tail_start,
                kept_groups = rest.len() - tail_start + 1,
                "context window trimmed"
            );
        }

        enforce_alternation(selected)
    }
}

/// 相邻的 user/user 或 assistant/assistant 之间插入合成轮次
fn enforce_alternation(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for msg in messages {
        if let Some(prev) = out.last() {
            match (prev.role, msg.role) {
                (Role::User, Role::User) => out.push(Message::assistant(SYNTHETIC_ACK)),
                (Role::Assistant, Role::Assistant) => out.push(Message::user(SYNTHETIC_CONTINUE)),
                _ => {}
            }
        }
        out.push(msg);
    }
    out
}

/// 修复工具调用配对：每个 assistant 的每个调用之后恰好一条对应结果
///
/// 缺失的结果补占位失败，重复或无主的 tool 消息被丢弃；结果按调用顺序排列。
pub fn sanitize_tool_pairs(messages: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        let msg = &messages[i];
        i += 1;
        if msg.role == Role::Tool {
            tracing::debug!(tool_call_id = ?msg.tool_call_id, "dropping orphan tool result");
            continue;
        }
        out.push(msg.clone());
        if msg.role != Role::Assistant || !msg.has_tool_calls() {
            continue;
        }
        let mut end = i;
        while end < messages.len() && messages[end].role == Role::Tool {
            end += 1;
        }
        let results = &messages[i..end];
        for call in &msg.tool_calls {
            let found = results
                .iter()
                .find(|r| r.tool_call_id.as_deref() == Some(call.id.as_str()));
            match found {
                Some(r) => out.push(r.clone()),
                None => {
                    tracing::debug!(tool_call_id = %call.id, "inserting placeholder tool result");
                    out.push(Message::tool(call.id.clone(), MISSING_RESULT_PLACEHOLDER));
                }
            }
        }
        i = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ToolCall;
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall::new(id, "execute_command", json!({"command": "uptime"}))
    }

    fn history(turns: usize) -> Vec<Message> {
        let mut messages = vec![Message::user("inspect the cluster")];
        for t in 0..turns {
            let a = format!("a{t}");
            let b = format!("b{t}");
            messages.push(Message::assistant_with_calls("", vec![call(&a), call(&b)]));
            messages.push(Message::tool(a, "ok"));
            messages.push(Message::tool(b, "ok"));
            messages.push(Message::assistant(format!("turn {t} done")));
            messages.push(Message::user(format!("next {t}")));
        }
        messages
    }

    /// 每个 tool 消息都能在它所在的连续 tool 块之前的 assistant 中找到对应调用
    fn assert_no_split(window: &[Message]) {
        for (i, m) in window.iter().enumerate() {
            if m.role != Role::Tool {
                continue;
            }
            let owner = window[..i]
                .iter()
                .rev()
                .find(|p| p.role != Role::Tool)
                .expect("tool message without preceding turn");
            let id = m.tool_call_id.as_deref().unwrap();
            assert!(owner.tool_calls.iter().any(|c| c.id == id), "split group at {i}");
        }
    }

    #[test]
    fn test_single_group_budget_keeps_whole_pair() {
        let messages = vec![
            Message::user("restart nginx"),
            Message::assistant_with_calls("", vec![call("c1")]),
            Message::tool("c1", "restarted"),
        ];
        let window = ContextWindowManager::new(1).apply(&messages);
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].content, "restart nginx");
        assert_eq!(window[2].tool_call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_never_splits_groups_for_any_budget() {
        let messages = history(4);
        for budget in 1..=12 {
            let window = ContextWindowManager::new(budget).apply(&messages);
            assert_eq!(window[0].content, "inspect the cluster");
            assert_no_split(&window);
        }
    }

    #[test]
    fn test_empty_messages_dropped_unless_they_carry_calls() {
        let messages = vec![
            Message::user("task"),
            Message::assistant(""),
            Message::assistant_with_calls("", vec![call("c1")]),
            Message::tool("c1", ""),
        ];
        let window = ContextWindowManager::new(5).apply(&messages);
        assert_eq!(window.len(), 3);
        assert!(window[1].has_tool_calls());
    }

    #[test]
    fn test_alternation_inserts_synthetic_turn() {
        let messages = vec![Message::user("one"), Message::user("two")];
        let window = ContextWindowManager::new(5).apply(&messages);
        assert_eq!(window.len(), 3);
        assert_eq!(window[1].role, Role::Assistant);
        assert_eq!(window[1].content, SYNTHETIC_ACK);
    }

    #[test]
    fn test_sanitize_inserts_placeholder_for_unanswered_call() {
        let messages = vec![
            Message::user("task"),
            Message::assistant_with_calls("", vec![call("c1"), call("c2")]),
            Message::tool("c2", "done"),
            Message::user("what happened?"),
        ];
        let sanitized = sanitize_tool_pairs(&messages);
        assert_eq!(sanitized.len(), 5);
        assert_eq!(sanitized[2].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(sanitized[2].content, MISSING_RESULT_PLACEHOLDER);
        assert_eq!(sanitized[3].tool_call_id.as_deref(), Some("c2"));
        assert_eq!(sanitized[3].content, "done");
    }

    #[test]
    fn test_sanitize_drops_orphans_and_duplicates() {
        let messages = vec![
            Message::tool("ghost", "orphan"),
            Message::user("task"),
            Message::assistant_with_calls("", vec![call("c1")]),
            Message::tool("c1", "first"),
            Message::tool("c1", "second"),
        ];
        let sanitized = sanitize_tool_pairs(&messages);
        let tool_msgs: Vec<_> = sanitized.iter().filter(|m| m.role == Role::Tool).collect();
        assert_eq!(tool_msgs.len(), 1);
        assert_eq!(tool_msgs[0].content, "first");
    }

    #[test]
    fn test_sanitized_window_pairs_every_call_exactly_once() {
        let mut messages = history(3);
        // 末尾留一个尚未执行的调用
        messages.push(Message::assistant_with_calls("", vec![call("late")]));
        for budget in 1..=6 {
            let window = ContextWindowManager::new(budget).apply(&messages);
            let sanitized = sanitize_tool_pairs(&window);
            for (i, m) in sanitized.iter().enumerate() {
                for c in &m.tool_calls {
                    let block: Vec<_> = sanitized[i + 1..]
                        .iter()
                        .take_while(|r| r.role == Role::Tool)
                        .filter(|r| r.tool_call_id.as_deref() == Some(c.id.as_str()))
                        .collect();
                    assert_eq!(block.len(), 1);
                }
            }
        }
    }
}
