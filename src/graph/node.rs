//! 图节点
//!
//! 节点读取当前 ExecutionState，返回部分更新，由引擎合并并提交检查点。
//! 节点返回 Err 即本次运行失败；工具失败、结构化输出解析失败都在节点内部就地恢复。

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::core::AgentError;
use crate::graph::trace::TraceSink;
use crate::graph::{ApprovalDecision, DecisionType, ExecutionState, GraphEngine, StateUpdate};
use crate::llm::ModelResponse;
use crate::memory::checkpoint::PendingWrite;
use crate::memory::{sanitize_tool_pairs, Message, Role, Todo, ToolCall, ToolResult};
use crate::tools::todo::{self, TASK, WRITE_TODOS};
use crate::tools::ToolInfo;

pub const PLANNER_PROMPT: &str = "You are an operations planner. Break the user's task into a short ordered list of concrete steps. \
Reply with JSON only: {\"steps\": [\"...\"]}.";
pub const AGENT_PROMPT: &str = "You are an operations agent. Use the available tools to inspect and change systems. \
Keep the todo list current with write_todos. When the task is done, answer with a concise summary.";
pub const ORCHESTRATOR_PROMPT: &str = "You are an operations orchestrator. Delegate self-contained investigations to subagents \
with the task tool, track progress with write_todos, and combine the results into a final answer.";
pub const SUBAGENT_PROMPT: &str = "You are a focused subagent. Complete the delegated task with the tools you have and reply with a concise result.";
pub const REFLECT_PROMPT: &str = "You review an operations agent's latest answer against the original task.";
const REFLECT_INSTRUCTION: &str = "Evaluate the latest answer. Reply with JSON only: \
{\"is_complete\": true|false, \"critique\": \"what is missing or wrong\"}.";
const STOPPED_AT_LIMIT: &str = "Stopped after reaching the iteration limit.";
const FALLBACK_CRITIQUE: &str = "continue";
const TOOL_RESULTS_CHANNEL: &str = "tool_results";

/// 单步执行时节点可见的上下文
pub struct NodeContext<'a> {
    pub engine: &'a GraphEngine,
    /// 根线程 id
    pub thread_id: &'a str,
    /// 本次运行的检查点键（子智能体为 `<thread>/<namespace>`）
    pub checkpoint_key: &'a str,
    pub namespace: &'a [String],
    pub step_id: u64,
    /// 本步携带的审批决策（按 tool_call_id）
    pub decisions: Option<&'a HashMap<String, ApprovalDecision>>,
    /// 崩溃前本步已记录的工具结果（按 tool_call_id）
    pub recovered: &'a HashMap<String, ToolResult>,
    pub trace: &'a TraceSink,
}

#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, state: &ExecutionState, ctx: &NodeContext<'_>) -> Result<StateUpdate, AgentError>;
}

/// 节点可用的工具范围
#[derive(Debug, Clone)]
pub enum ToolScope {
    All,
    Only(Vec<String>),
    AllExcept(Vec<String>),
}

/// 模型可见工具：外部/本地工具按范围过滤，再按需追加内置工具
#[derive(Debug, Clone)]
pub struct ToolAccess {
    pub scope: ToolScope,
    pub todos: bool,
    pub delegation: bool,
}

impl ToolAccess {
    async fn resolve(&self, ctx: &NodeContext<'_>) -> Vec<ToolInfo> {
        let executor = ctx.engine.tools();
        let mut infos = match &self.scope {
            ToolScope::All => executor.available_tools(None).await,
            ToolScope::Only(names) => executor.available_tools(Some(names.as_slice())).await,
            ToolScope::AllExcept(names) => {
                let mut all = executor.available_tools(None).await;
                all.retain(|t| !names.contains(&t.name));
                all
            }
        };
        if self.todos {
            infos.push(todo::write_todos_info());
        }
        if self.delegation && ctx.engine.has_subagents() {
            infos.push(todo::task_info(&ctx.engine.subagent_entries()));
        }
        infos
    }
}

/// 组装模型输入：system → 计划 → 裁剪并修复后的历史 → 可选的临时轮次（不写入状态）
async fn invoke_model(
    ctx: &NodeContext<'_>,
    system: &str,
    state: &ExecutionState,
    transient: Option<Message>,
    tools: &[ToolInfo],
) -> Result<ModelResponse, AgentError> {
    let mut messages = vec![Message::system(system)];
    if !state.plan.is_empty() {
        let plan = state
            .plan
            .iter()
            .enumerate()
            .map(|(i, s)| format!("{}. {}", i + 1, s))
            .collect::<Vec<_>>()
            .join("\n");
        messages.push(Message::system(format!("Plan:\n{plan}")));
    }
    let mut window = ctx.engine.window().apply(&state.messages);
    if let Some(extra) = transient {
        window.push(extra);
    }
    messages.extend(sanitize_tool_pairs(&window));
    ctx.engine.model().invoke(&messages, tools).await
}

/// 模型回复 → assistant 消息；缺失的调用 id 就地补齐
fn response_message(resp: ModelResponse) -> Message {
    let calls = resp
        .tool_calls
        .into_iter()
        .map(|mut c| {
            if c.id.is_empty() {
                c.id = format!("call_{}", uuid::Uuid::new_v4().simple());
            }
            c
        })
        .collect::<Vec<_>>();
    if calls.is_empty() {
        Message::assistant(resp.content)
    } else {
        Message::assistant_with_calls(resp.content, calls)
    }
}

/// 去掉 ``` 代码块包裹，截取第一个 JSON 值所在片段
fn json_slice(raw: &str) -> &str {
    let trimmed = raw.trim();
    let open = trimmed.find(['{', '[']);
    let close = trimmed.rfind(['}', ']']);
    match (open, close) {
        (Some(s), Some(e)) if e >= s => &trimmed[s..=e],
        _ => trimmed,
    }
}

pub fn parse_plan(raw: &str) -> Result<Vec<String>, AgentError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PlanShape {
        Steps { steps: Vec<String> },
        List(Vec<String>),
    }
    let shape: PlanShape = serde_json::from_str(json_slice(raw))
        .map_err(|e| AgentError::Parse(format!("plan: {e}")))?;
    let steps: Vec<String> = match shape {
        PlanShape::Steps { steps } | PlanShape::List(steps) => steps,
    }
    .into_iter()
    .map(|s| s.trim().to_string())
    .filter(|s| !s.is_empty())
    .collect();
    if steps.is_empty() {
        return Err(AgentError::Parse("plan has no steps".to_string()));
    }
    Ok(steps)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Critique {
    pub is_complete: bool,
    #[serde(default)]
    pub critique: String,
}

pub fn parse_critique(raw: &str) -> Result<Critique, AgentError> {
    serde_json::from_str(json_slice(raw)).map_err(|e| AgentError::Parse(format!("critique: {e}")))
}

/// 计划：解析失败时退化为单步计划（原始任务本身）
pub struct PlannerNode;

#[async_trait]
impl Node for PlannerNode {
    fn name(&self) -> &str {
        "planner"
    }

    async fn run(&self, state: &ExecutionState, ctx: &NodeContext<'_>) -> Result<StateUpdate, AgentError> {
        let resp = invoke_model(ctx, PLANNER_PROMPT, state, None, &[]).await?;
        let plan = match parse_plan(&resp.content) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "plan unparseable, falling back to single step");
                vec![state.last_user_input().unwrap_or_default().to_string()]
            }
        };
        Ok(StateUpdate::default().plan(plan))
    }
}

/// 生成：调用模型，可请求工具（深度变体中也作为编排器 / 子智能体的 agent 节点）
pub struct GenerateNode {
    name: &'static str,
    system_prompt: String,
    access: ToolAccess,
}

impl GenerateNode {
    pub fn new(name: &'static str, system_prompt: impl Into<String>, access: ToolAccess) -> Self {
        Self {
            name,
            system_prompt: system_prompt.into(),
            access,
        }
    }
}

#[async_trait]
impl Node for GenerateNode {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, state: &ExecutionState, ctx: &NodeContext<'_>) -> Result<StateUpdate, AgentError> {
        let tools = self.access.resolve(ctx).await;
        let resp = invoke_model(ctx, &self.system_prompt, state, None, &tools).await?;
        Ok(StateUpdate::default().messages(vec![response_message(resp)]))
    }
}

/// 反思：产出结构化批判；解析失败时保守地继续，绝不标记完成
pub struct ReflectNode;

#[async_trait]
impl Node for ReflectNode {
    fn name(&self) -> &str {
        "reflect"
    }

    async fn run(&self, state: &ExecutionState, ctx: &NodeContext<'_>) -> Result<StateUpdate, AgentError> {
        let ask = Message::user(REFLECT_INSTRUCTION);
        let resp = invoke_model(ctx, REFLECT_PROMPT, state, Some(ask), &[]).await?;
        let critique = parse_critique(&resp.content).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "critique unparseable, continuing");
            Critique {
                is_complete: false,
                critique: FALLBACK_CRITIQUE.to_string(),
            }
        });
        Ok(StateUpdate::default()
            .complete(critique.is_complete)
            .next_action(Some(critique.critique)))
    }
}

/// 修订：把批判作为临时用户轮次交给模型（不写入历史），回复可再次请求工具
pub struct ReviseNode {
    system_prompt: String,
    access: ToolAccess,
}

impl ReviseNode {
    pub fn new(system_prompt: impl Into<String>, access: ToolAccess) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            access,
        }
    }
}

#[async_trait]
impl Node for ReviseNode {
    fn name(&self) -> &str {
        "revise"
    }

    async fn run(&self, state: &ExecutionState, ctx: &NodeContext<'_>) -> Result<StateUpdate, AgentError> {
        let critique = state.next_action.as_deref().unwrap_or(FALLBACK_CRITIQUE);
        let turn = Message::user(format!(
            "Reviewer feedback on your previous answer: {critique}\nRevise the answer, using tools if needed."
        ));
        let tools = self.access.resolve(ctx).await;
        let resp = invoke_model(ctx, &self.system_prompt, state, Some(turn), &tools).await?;
        Ok(StateUpdate::default()
            .messages(vec![response_message(resp)])
            .next_action(None))
    }
}

/// 执行最后一条 assistant 消息中的全部待处理调用（并发），结果按调用顺序回填
pub struct ToolsNode;

impl ToolsNode {
    async fn run_call(
        &self,
        call: ToolCall,
        ctx: &NodeContext<'_>,
    ) -> Result<(ToolResult, Option<Vec<Todo>>), AgentError> {
        if let Some(done) = ctx.recovered.get(&call.id) {
            tracing::info!(tool_call_id = %call.id, tool = %call.name, "reusing recorded tool result");
            let todos = (call.name == WRITE_TODOS)
                .then(|| todo::parse_todos(&call.args).ok())
                .flatten();
            return Ok((done.clone(), todos));
        }

        // 子图不会中断，审批工具在这里无从获批
        if !ctx.namespace.is_empty() && ctx.engine.settings().requires_approval(&call) {
            tracing::warn!(tool_call_id = %call.id, tool = %call.name, "gated tool refused inside subagent");
            let result = ToolResult::error(
                &call.id,
                &call.name,
                format!("tool '{}' requires operator approval and is not available to subagents", call.name),
            );
            self.record(ctx, &result).await?;
            return Ok((result, None));
        }

        let mut call = call;
        let mut edited = None;
        if let Some(decision) = ctx.decisions.and_then(|d| d.get(&call.id)) {
            match decision.decision_type {
                DecisionType::Approve => {}
                DecisionType::Edit => {
                    if let Some(args) = &decision.args {
                        call.args = args.clone();
                        edited = Some(args.clone());
                    }
                }
                DecisionType::Reject => {
                    let feedback = decision.feedback.as_deref().unwrap_or("no reason given");
                    tracing::info!(tool_call_id = %call.id, tool = %call.name, "tool call rejected by operator");
                    let result = ToolResult::error(
                        &call.id,
                        &call.name,
                        format!("rejected by operator: {feedback}"),
                    );
                    self.record(ctx, &result).await?;
                    return Ok((result, None));
                }
            }
        }

        let mut todos = None;
        let result = match call.name.as_str() {
            WRITE_TODOS => match todo::parse_todos(&call.args) {
                Ok(list) => {
                    let out = ToolResult::new(&call.id, &call.name, format!("Updated todo list ({} items)", list.len()));
                    todos = Some(list);
                    out
                }
                Err(e) => ToolResult::error(&call.id, &call.name, e),
            },
            TASK => match ctx.engine.run_subagent(ctx, &call).await {
                Ok(text) => ToolResult::new(&call.id, &call.name, text),
                Err(e) => {
                    tracing::warn!(tool_call_id = %call.id, error = %e, "subagent failed");
                    ToolResult::error(&call.id, &call.name, e)
                }
            },
            _ => ctx.engine.tools().execute(&call).await,
        };
        // 历史里的调用仍是原参数，结果需说明实际执行的参数
        let result = match edited {
            Some(args) => ToolResult {
                output: format!("{}\n[edited by operator; executed with args {args}]", result.output),
                ..result
            },
            None => result,
        };
        self.record(ctx, &result).await?;
        Ok((result, todos))
    }

    /// 结果一产生就写入写日志，崩溃后重跑本步时直接复用
    async fn record(&self, ctx: &NodeContext<'_>, result: &ToolResult) -> Result<(), AgentError> {
        let write = PendingWrite {
            task_id: result.tool_call_id.clone(),
            channel: TOOL_RESULTS_CHANNEL.to_string(),
            value: serde_json::to_value(result)?,
        };
        ctx.engine
            .checkpoints()
            .put_writes(ctx.checkpoint_key, ctx.step_id, vec![write])
            .await
    }
}

/// 写日志条目 → 工具结果（其它通道忽略）
pub fn recovered_results(writes: Vec<PendingWrite>) -> HashMap<String, ToolResult> {
    writes
        .into_iter()
        .filter(|w| w.channel == TOOL_RESULTS_CHANNEL)
        .filter_map(|w| {
            serde_json::from_value::<ToolResult>(w.value)
                .ok()
                .map(|r| (w.task_id, r))
        })
        .collect()
}

#[async_trait]
impl Node for ToolsNode {
    fn name(&self) -> &str {
        "tools"
    }

    async fn run(&self, state: &ExecutionState, ctx: &NodeContext<'_>) -> Result<StateUpdate, AgentError> {
        let calls = state.pending_calls();
        let outcomes =
            futures_util::future::join_all(calls.into_iter().map(|c| self.run_call(c, ctx))).await;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut todos = None;
        for outcome in outcomes {
            let (result, t) = outcome?;
            if t.is_some() {
                todos = t;
            }
            results.push(result);
        }
        let messages = results.iter().map(ToolResult::to_message).collect();
        let mut update = StateUpdate::default().messages(messages).tool_results(results);
        if let Some(list) = todos {
            update = update.todos(list);
        }
        Ok(update)
    }
}

/// 收尾：不调用模型；已有最终回答则只标记完成，否则补一条停止说明
pub struct FinalNode;

#[async_trait]
impl Node for FinalNode {
    fn name(&self) -> &str {
        "final"
    }

    async fn run(&self, state: &ExecutionState, _ctx: &NodeContext<'_>) -> Result<StateUpdate, AgentError> {
        let answered = state
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| !m.content.trim().is_empty() && state.pending_calls().is_empty())
            .unwrap_or(false);
        let update = StateUpdate::default().complete(true);
        if answered {
            Ok(update)
        } else {
            Ok(update.messages(vec![Message::assistant(STOPPED_AT_LIMIT)]))
        }
    }
}
