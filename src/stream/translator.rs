//! 执行轨迹 → 单一有序事件流
//!
//! 根图（空命名空间）的更新直接翻译；嵌套命名空间的更新需要找到对应委派的外部 id。
//! 子图的命名空间是子图自己生成的，不等于外部 id，因此按委派顺序（FIFO）绑定：
//! 第一次出现的命名空间绑定到最早的、尚未绑定且尚未完成的委派，之后同一命名空间都解析到该外部 id。
//! 同一步内并发委派多个子智能体时可能绑错。
//!
//! 每次运行恰好发出一个 `done`，之后不再发出任何事件。

use std::collections::HashMap;

use chrono::Utc;

use crate::graph::{StateUpdate, TraceEntry};
use crate::memory::{Role, ToolCall};
use crate::stream::{DispatchStatus, StreamEvent, SubagentDispatch};
use crate::tools::todo::{self, TASK};

pub struct StreamTranslator {
    thread_id: String,
    /// 按委派顺序
    dispatches: Vec<SubagentDispatch>,
    /// 命名空间首段 → 外部 id
    bindings: HashMap<String, String>,
    done_sent: bool,
}

impl StreamTranslator {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            dispatches: Vec::new(),
            bindings: HashMap::new(),
            done_sent: false,
        }
    }

    /// 恢复运行时重建上一段已开始、尚未完成的委派；不重复发 subagent-start
    pub fn reopen(&mut self, calls: &[ToolCall]) {
        for call in calls.iter().filter(|c| c.name == TASK) {
            if self.dispatches.iter().any(|d| d.id == call.id) {
                continue;
            }
            self.open_dispatch(call.id.clone(), &call.args);
        }
    }

    pub fn dispatches(&self) -> &[SubagentDispatch] {
        &self.dispatches
    }

    pub fn is_done(&self) -> bool {
        self.done_sent
    }

    pub fn translate(&mut self, entry: TraceEntry) -> Vec<StreamEvent> {
        if self.done_sent {
            tracing::debug!(thread_id = %self.thread_id, "trace entry after done dropped");
            return Vec::new();
        }
        match entry {
            TraceEntry::Update {
                namespace, update, ..
            } => match namespace.first() {
                None => self.root_update(update),
                Some(segment) => self.nested_update(segment, update),
            },
            TraceEntry::Interrupt { request, .. } => vec![StreamEvent::ApprovalRequired(request)],
            TraceEntry::Failed { message } => {
                let mut events = vec![StreamEvent::Error { message }];
                events.extend(self.finish());
                events
            }
        }
    }

    /// 结束事件；只发一次
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.done_sent {
            return Vec::new();
        }
        self.done_sent = true;
        vec![StreamEvent::Done {
            thread_id: self.thread_id.clone(),
        }]
    }

    fn root_update(&mut self, update: StateUpdate) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for message in update.messages.unwrap_or_default() {
            if message.role != Role::Assistant {
                continue;
            }
            if !message.content.is_empty() {
                events.push(StreamEvent::TextDelta {
                    text: message.content,
                });
            }
            for call in message.tool_calls {
                if call.name == TASK {
                    events.push(self.open_dispatch(call.id, &call.args));
                } else {
                    events.push(StreamEvent::ToolCall {
                        tool_call_id: call.id,
                        tool_name: call.name,
                        args: call.args,
                    });
                }
            }
        }
        for result in update.tool_results.unwrap_or_default() {
            let failed = result.is_error();
            let id = result.tool_call_id.clone();
            let output = result.output.clone();
            events.push(StreamEvent::ToolResult {
                tool_call_id: result.tool_call_id,
                tool_name: result.tool_name,
                result: result.output,
            });
            if let Some(ev) = self.close_dispatch(&id, failed, output) {
                events.push(ev);
            }
        }
        if let Some(todos) = update.todos {
            events.push(StreamEvent::TodoUpdate { todos });
        }
        events
    }

    fn nested_update(&mut self, segment: &str, update: StateUpdate) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(outer) = self.resolve(segment) {
            for message in update.messages.unwrap_or_default() {
                if message.role == Role::Assistant && !message.content.is_empty() {
                    events.push(StreamEvent::SubagentDelta {
                        tool_call_id: outer.clone(),
                        text: message.content,
                    });
                }
            }
            for result in update.tool_results.unwrap_or_default() {
                events.push(StreamEvent::SubagentTool {
                    tool_call_id: outer.clone(),
                    tool_name: result.tool_name,
                    result: result.output,
                });
            }
        } else {
            tracing::warn!(
                thread_id = %self.thread_id,
                namespace = segment,
                "no open dispatch for subagent namespace"
            );
        }
        if let Some(todos) = update.todos {
            events.push(StreamEvent::TodoUpdate { todos });
        }
        events
    }

    fn open_dispatch(&mut self, id: String, args: &serde_json::Value) -> StreamEvent {
        let (name, description) = match todo::parse_task(args) {
            Ok(task) => (task.name, task.description),
            Err(_) => ("unknown".to_string(), String::new()),
        };
        let dispatch = SubagentDispatch {
            id,
            name,
            description,
            status: DispatchStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
        };
        let event = StreamEvent::SubagentStart {
            id: dispatch.id.clone(),
            name: dispatch.name.clone(),
            description: dispatch.description.clone(),
            status: dispatch.status,
            started_at: dispatch.started_at,
        };
        self.dispatches.push(dispatch);
        event
    }

    /// 命名空间 → 外部 id；首次出现时按 FIFO 绑定
    fn resolve(&mut self, segment: &str) -> Option<String> {
        if let Some(outer) = self.bindings.get(segment) {
            return Some(outer.clone());
        }
        let dispatch = self.dispatches.iter_mut().find(|d| {
            !d.status.is_finished() && !self.bindings.values().any(|bound| *bound == d.id)
        })?;
        dispatch.status = DispatchStatus::Running;
        self.bindings.insert(segment.to_string(), dispatch.id.clone());
        tracing::debug!(
            thread_id = %self.thread_id,
            namespace = segment,
            dispatch = %dispatch.id,
            "namespace bound to dispatch"
        );
        Some(dispatch.id.clone())
    }

    fn close_dispatch(&mut self, id: &str, failed: bool, output: String) -> Option<StreamEvent> {
        let dispatch = self
            .dispatches
            .iter_mut()
            .find(|d| d.id == id && !d.status.is_finished())?;
        let now = Utc::now();
        dispatch.status = if failed {
            DispatchStatus::Error
        } else {
            DispatchStatus::Complete
        };
        dispatch.completed_at = Some(now);
        dispatch.result = Some(output.clone());
        Some(StreamEvent::SubagentComplete {
            id: dispatch.id.clone(),
            status: dispatch.status,
            completed_at: now,
            result: output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::graph::ApprovalRequest;
    use crate::memory::{Message, Todo, TodoStatus, ToolCall, ToolResult};

    fn root(update: StateUpdate) -> TraceEntry {
        TraceEntry::Update {
            namespace: vec![],
            node: "agent".into(),
            update,
        }
    }

    fn nested(ns: &str, update: StateUpdate) -> TraceEntry {
        TraceEntry::Update {
            namespace: vec![ns.to_string()],
            node: "agent".into(),
            update,
        }
    }

    fn dispatch_call(id: &str, name: &str) -> StateUpdate {
        StateUpdate::default().messages(vec![Message::assistant_with_calls(
            "",
            vec![ToolCall::new(id, TASK, json!({"name": name, "description": "inspect pods"}))],
        )])
    }

    fn finished(id: &str, output: &str) -> StateUpdate {
        StateUpdate::default().tool_results(vec![ToolResult::new(id, TASK, output)])
    }

    #[test]
    fn test_root_text_and_tool_events() {
        let mut t = StreamTranslator::new("t1");
        let events = t.translate(root(StateUpdate::default().messages(vec![
            Message::assistant_with_calls(
                "checking",
                vec![ToolCall::new("c1", "execute_command", json!({"command": "df -h"}))],
            ),
        ])));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::TextDelta { text: "checking".into() });
        assert_eq!(events[1].name(), "tool-call");

        let events = t.translate(root(StateUpdate::default().tool_results(vec![ToolResult::new(
            "c1",
            "execute_command",
            "50% used",
        )])));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "tool-result");
    }

    #[test]
    fn test_single_pending_dispatch_binds_unseen_namespace() {
        let mut t = StreamTranslator::new("t1");
        let start = t.translate(root(dispatch_call("call_outer", "researcher")));
        assert_eq!(start[0].name(), "subagent-start");

        let events = t.translate(nested(
            "researcher:abc",
            StateUpdate::default().messages(vec![Message::assistant("found 3 pods")]),
        ));
        assert_eq!(
            events,
            vec![StreamEvent::SubagentDelta {
                tool_call_id: "call_outer".into(),
                text: "found 3 pods".into()
            }]
        );
        let events = t.translate(nested(
            "researcher:abc",
            StateUpdate::default().tool_results(vec![ToolResult::new("x", "kubectl", "ok")]),
        ));
        assert!(matches!(
            &events[0],
            StreamEvent::SubagentTool { tool_call_id, .. } if tool_call_id == "call_outer"
        ));

        let events = t.translate(root(finished("call_outer", "3 pods healthy")));
        let completes = events.iter().filter(|e| e.name() == "subagent-complete").count();
        assert_eq!(completes, 1);
        // 同一结果再次出现不会重复完成
        let events = t.translate(root(finished("call_outer", "3 pods healthy")));
        assert!(events.iter().all(|e| e.name() != "subagent-complete"));
        assert_eq!(t.dispatches()[0].status, DispatchStatus::Complete);
    }

    #[test]
    fn test_reopened_dispatch_binds_and_completes_without_new_start() {
        let mut t = StreamTranslator::new("t1");
        t.reopen(&[
            ToolCall::new("c1", "execute_command", json!({"command": "df -h"})),
            ToolCall::new("call_outer", TASK, json!({"name": "researcher", "description": "inspect pods"})),
        ]);
        assert_eq!(t.dispatches().len(), 1);
        assert_eq!(t.dispatches()[0].name, "researcher");

        let events = t.translate(nested(
            "researcher:abc",
            StateUpdate::default().messages(vec![Message::assistant("found 3 pods")]),
        ));
        assert_eq!(
            events,
            vec![StreamEvent::SubagentDelta {
                tool_call_id: "call_outer".into(),
                text: "found 3 pods".into()
            }]
        );
        let events = t.translate(root(finished("call_outer", "3 pods healthy")));
        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["tool-result", "subagent-complete"]);
    }

    #[test]
    fn test_dispatches_bind_in_order() {
        let mut t = StreamTranslator::new("t1");
        t.translate(root(dispatch_call("first", "a")));
        t.translate(root(dispatch_call("second", "b")));
        let delta = |events: Vec<StreamEvent>| match &events[0] {
            StreamEvent::SubagentDelta { tool_call_id, .. } => tool_call_id.clone(),
            other => panic!("unexpected {other:?}"),
        };
        let text = || StateUpdate::default().messages(vec![Message::assistant("hi")]);
        assert_eq!(delta(t.translate(nested("ns-1", text()))), "first");
        assert_eq!(delta(t.translate(nested("ns-2", text()))), "second");
        assert_eq!(delta(t.translate(nested("ns-1", text()))), "first");
    }

    #[test]
    fn test_failed_dispatch_reports_error_status() {
        let mut t = StreamTranslator::new("t1");
        t.translate(root(dispatch_call("c9", "a")));
        let events = t.translate(root(finished("c9", "Error: unknown subagent: a")));
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::SubagentComplete { status: DispatchStatus::Error, .. }
        )));
    }

    #[test]
    fn test_todo_and_approval_events() {
        let mut t = StreamTranslator::new("t1");
        let todos = vec![Todo {
            content: "check nodes".into(),
            status: TodoStatus::InProgress,
        }];
        let events = t.translate(root(StateUpdate::default().todos(todos.clone())));
        assert_eq!(events, vec![StreamEvent::TodoUpdate { todos }]);

        let request = ApprovalRequest::for_calls(
            "t1",
            &[ToolCall::new("c1", "execute_command", json!({"command": "rm -rf /"}))],
        );
        let events = t.translate(TraceEntry::Interrupt {
            namespace: vec![],
            request,
        });
        let v = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(v["event"], "approval-required");
        assert_eq!(v["data"]["actionRequests"][0]["name"], "execute_command");
    }

    #[test]
    fn test_done_exactly_once() {
        let mut t = StreamTranslator::new("t1");
        let events = t.translate(TraceEntry::Failed {
            message: "Model invocation failed: 503".into(),
        });
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "error");
        assert_eq!(events[1], StreamEvent::Done { thread_id: "t1".into() });

        assert!(t.finish().is_empty());
        assert!(t
            .translate(root(StateUpdate::default().messages(vec![Message::assistant("late")])))
            .is_empty());
        assert!(t.is_done());
    }
}
