//! 图执行引擎
//!
//! 一次只执行一个节点；每个节点之后合并状态、计算下一跳并提交检查点，再发出轨迹。
//! - 中断点：进入标记了 interrupt_before 的节点前，若有需要审批的调用，则不执行该节点，
//!   以 AwaitingApproval 状态提交检查点并返回 ApprovalRequest
//! - 节点失败：直接返回错误，检查点停留在上一次成功提交的步
//! - 预算：路由函数在预算耗尽时引向终结节点；超出预算仍未终结时引擎强制跳转
//! - 子智能体：task 调用作为嵌套运行执行，检查点键为 `<thread>/<namespace>`，从不中断

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;

use crate::config::{AppConfig, SubagentEntry};
use crate::core::AgentError;
use crate::graph::builder::{subagent_graph, Budget, Graph};
use crate::graph::node::{recovered_results, NodeContext};
use crate::graph::trace::{Namespace, TraceEntry, TraceSink};
use crate::graph::{ApprovalDecision, ApprovalRequest, ExecutionState, StateLimits};
use crate::llm::ModelClient;
use crate::memory::{Checkpoint, CheckpointSaver, ContextWindowManager, Message, RunStatus, ToolCall};
use crate::tools::todo;
use crate::tools::ToolExecutor;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_iterations: usize,
    pub limits: StateLimits,
    pub auto_approve: bool,
    pub interrupt_on: HashSet<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_iterations: cfg.engine.max_iterations,
            limits: StateLimits {
                max_messages: cfg.engine.max_messages,
                max_tool_results: cfg.engine.max_tool_results,
            },
            auto_approve: cfg.engine.auto_approve,
            interrupt_on: cfg.engine.interrupt_on.iter().cloned().collect(),
        }
    }

    pub(crate) fn requires_approval(&self, call: &ToolCall) -> bool {
        !self.auto_approve && self.interrupt_on.contains(&call.name)
    }
}

/// 一次 start / resume 的结果
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(ExecutionState),
    Interrupted(ApprovalRequest),
}

/// 一次（可能嵌套的）运行的作用域
struct RunScope<'a> {
    graph: &'a Graph,
    thread_id: &'a str,
    key: String,
    namespace: Namespace,
    trace: &'a TraceSink,
}

pub struct GraphEngine {
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolExecutor>,
    checkpoints: Arc<CheckpointSaver>,
    window: ContextWindowManager,
    settings: EngineSettings,
    subagents: Vec<SubagentEntry>,
}

impl GraphEngine {
    pub fn new(
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolExecutor>,
        checkpoints: Arc<CheckpointSaver>,
        window: ContextWindowManager,
        settings: EngineSettings,
    ) -> Self {
        Self {
            model,
            tools,
            checkpoints,
            window,
            settings,
            subagents: Vec::new(),
        }
    }

    pub fn with_subagents(mut self, subagents: Vec<SubagentEntry>) -> Self {
        self.subagents = subagents;
        self
    }

    pub fn model(&self) -> &Arc<dyn ModelClient> {
        &self.model
    }

    pub fn tools(&self) -> &ToolExecutor {
        &self.tools
    }

    pub fn checkpoints(&self) -> &CheckpointSaver {
        &self.checkpoints
    }

    pub fn window(&self) -> &ContextWindowManager {
        &self.window
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn has_subagents(&self) -> bool {
        !self.subagents.is_empty()
    }

    pub fn subagent_entries(&self) -> &[SubagentEntry] {
        &self.subagents
    }

    /// 校验线程可以开始新一轮；返回上一轮的检查点（若有）
    pub async fn prepare_start(&self, thread_id: &str) -> Result<Option<Checkpoint>, AgentError> {
        let latest = self.checkpoints.get(thread_id).await?;
        if let Some(cp) = &latest {
            match cp.status {
                RunStatus::AwaitingApproval => {
                    return Err(AgentError::validation(format!(
                        "thread '{thread_id}' is awaiting approval; resume it with decisions"
                    )));
                }
                RunStatus::Running if cp.next_node.is_some() => {
                    tracing::warn!(
                        thread_id,
                        step = cp.step_id,
                        next_node = ?cp.next_node,
                        "abandoning unfinished run"
                    );
                }
                _ => {}
            }
        }
        Ok(latest)
    }

    /// 校验恢复请求；任何失败都发生在触碰引擎状态之前
    pub async fn prepare_resume(
        &self,
        thread_id: &str,
        decisions: &[ApprovalDecision],
    ) -> Result<Checkpoint, AgentError> {
        let cp = self
            .checkpoints
            .get(thread_id)
            .await?
            .ok_or_else(|| AgentError::validation(format!("thread '{thread_id}' has no checkpoint")))?;
        match cp.status {
            RunStatus::AwaitingApproval => {
                let request = cp.pending_approval.as_ref().ok_or_else(|| {
                    AgentError::validation(format!("thread '{thread_id}' has no pending approval request"))
                })?;
                request.validate(decisions)?;
            }
            // 进程在步中退出：无需决策，直接续跑
            RunStatus::Running if cp.next_node.is_some() => {
                if !decisions.is_empty() {
                    return Err(AgentError::validation(format!(
                        "thread '{thread_id}' has no pending approval; expected 0 decisions, got {}",
                        decisions.len()
                    )));
                }
            }
            _ => {
                return Err(AgentError::validation(format!(
                    "thread '{thread_id}' has no run to resume"
                )));
            }
        }
        Ok(cp)
    }

    /// 以一条用户输入开始新一轮
    pub async fn start(
        &self,
        graph: &Graph,
        thread_id: &str,
        input: Message,
        trace: &TraceSink,
    ) -> Result<RunOutcome, AgentError> {
        let (state, step) = match self.prepare_start(thread_id).await? {
            Some(cp) => {
                let mut state = cp.state;
                state.begin_turn(input, &self.settings.limits);
                (state, cp.step_id)
            }
            None => (ExecutionState::with_input(input), 0),
        };
        tracing::info!(thread_id, step, "run started");
        let scope = RunScope {
            graph,
            thread_id,
            key: thread_id.to_string(),
            namespace: Vec::new(),
            trace,
        };
        self.execute(&scope, state, step, graph.entry(), None).await
    }

    /// 按决策（与待审批调用一一对应）从中断点继续；崩溃后续跑时决策为空
    pub async fn resume(
        &self,
        graph: &Graph,
        thread_id: &str,
        decisions: Vec<ApprovalDecision>,
        trace: &TraceSink,
    ) -> Result<RunOutcome, AgentError> {
        let cp = self.prepare_resume(thread_id, &decisions).await?;
        let next = cp
            .next_node
            .as_deref()
            .and_then(|n| graph.resolve(n))
            .ok_or_else(|| {
                AgentError::validation(format!(
                    "checkpoint next node {:?} is not part of this graph",
                    cp.next_node
                ))
            })?;
        let paired = cp.pending_approval.as_ref().map(|r| r.pair(decisions));
        tracing::info!(thread_id, step = cp.step_id, node = next, "run resumed");
        let scope = RunScope {
            graph,
            thread_id,
            key: thread_id.to_string(),
            namespace: Vec::new(),
            trace,
        };
        self.execute(&scope, cp.state, cp.step_id, next, paired).await
    }

    /// 检查点历史，最新在前
    pub async fn history(&self, thread_id: &str, limit: usize) -> Result<Vec<Checkpoint>, AgentError> {
        self.checkpoints.list(thread_id, limit).await
    }

    async fn execute(
        &self,
        scope: &RunScope<'_>,
        mut state: ExecutionState,
        mut step: u64,
        mut current: &'static str,
        mut decisions: Option<HashMap<String, ApprovalDecision>>,
    ) -> Result<RunOutcome, AgentError> {
        let graph = scope.graph;
        let budget = Budget {
            max_iterations: self.settings.max_iterations,
        };

        loop {
            if state.iteration_count > budget.max_iterations && current != graph.finalizer() {
                tracing::warn!(
                    key = %scope.key,
                    iterations = state.iteration_count,
                    skipped = current,
                    "iteration budget exceeded, finalizing"
                );
                current = graph.finalizer();
            }

            if decisions.is_none() && graph.interrupts_before(current) {
                let gated: Vec<ToolCall> = state
                    .pending_calls()
                    .into_iter()
                    .filter(|c| self.settings.requires_approval(c))
                    .collect();
                if !gated.is_empty() {
                    step += 1;
                    let request = ApprovalRequest::for_calls(scope.thread_id, &gated);
                    self.checkpoints
                        .put(Checkpoint {
                            thread_id: scope.key.clone(),
                            step_id: step,
                            state,
                            created_at: Utc::now(),
                            next_node: Some(current.to_string()),
                            status: RunStatus::AwaitingApproval,
                            pending_approval: Some(request.clone()),
                        })
                        .await?;
                    tracing::info!(
                        key = %scope.key,
                        step,
                        node = current,
                        actions = gated.len(),
                        "interrupted for approval"
                    );
                    scope.trace.emit(TraceEntry::Interrupt {
                        namespace: scope.namespace.clone(),
                        request: request.clone(),
                    });
                    return Ok(RunOutcome::Interrupted(request));
                }
            }

            step += 1;
            let node = graph
                .node(current)
                .ok_or_else(|| AgentError::Config(format!("graph has no node '{current}'")))?;
            let recovered =
                recovered_results(self.checkpoints.pending_writes(&scope.key, step).await?);
            let ctx = NodeContext {
                engine: self,
                thread_id: scope.thread_id,
                checkpoint_key: &scope.key,
                namespace: &scope.namespace,
                step_id: step,
                decisions: decisions.as_ref(),
                recovered: &recovered,
                trace: scope.trace,
            };
            tracing::debug!(key = %scope.key, step, node = current, "running node");
            let update = node.run(&state, &ctx).await.map_err(|e| {
                tracing::error!(key = %scope.key, step, node = current, error = %e, "node failed");
                e
            })?;
            decisions = None;

            state.apply(update.clone(), &self.settings.limits);
            state.merge_iteration(1);
            let next = graph.next(current, &state, &budget);
            self.checkpoints
                .put(Checkpoint {
                    thread_id: scope.key.clone(),
                    step_id: step,
                    state: state.clone(),
                    created_at: Utc::now(),
                    next_node: next.map(str::to_string),
                    status: if next.is_some() {
                        RunStatus::Running
                    } else {
                        RunStatus::Completed
                    },
                    pending_approval: None,
                })
                .await?;
            scope.trace.emit(TraceEntry::Update {
                namespace: scope.namespace.clone(),
                node: current.to_string(),
                update,
            });

            match next {
                Some(n) => current = n,
                None => {
                    tracing::info!(
                        key = %scope.key,
                        step,
                        iterations = state.iteration_count,
                        "run completed"
                    );
                    return Ok(RunOutcome::Completed(state));
                }
            }
        }
    }

    /// 执行一次 task 委派，返回子智能体的最终回答
    pub fn run_subagent<'a>(
        &'a self,
        ctx: &'a NodeContext<'a>,
        call: &'a ToolCall,
    ) -> BoxFuture<'a, Result<String, AgentError>> {
        Box::pin(async move {
            let args = todo::parse_task(&call.args)?;
            let entry = self
                .subagents
                .iter()
                .find(|s| s.name == args.name)
                .ok_or_else(|| AgentError::ToolExecution(format!("unknown subagent: {}", args.name)))?;
            let gated: Vec<String> = if self.settings.auto_approve {
                Vec::new()
            } else {
                self.settings.interrupt_on.iter().cloned().collect()
            };
            let graph = subagent_graph(entry, &gated)?;

            let mut namespace = ctx.namespace.to_vec();
            namespace.push(format!("{}:{}", entry.name, uuid::Uuid::new_v4()));
            let key = format!("{}/{}", ctx.thread_id, namespace.join("/"));
            tracing::info!(
                thread_id = ctx.thread_id,
                subagent = %entry.name,
                tool_call_id = %call.id,
                key = %key,
                "subagent dispatched"
            );
            let scope = RunScope {
                graph: &graph,
                thread_id: ctx.thread_id,
                key,
                namespace,
                trace: ctx.trace,
            };
            let state = ExecutionState::with_input(Message::user(args.description));
            match self.execute(&scope, state, 0, graph.entry(), None).await? {
                RunOutcome::Completed(state) => {
                    Ok(state.last_assistant_text().unwrap_or_default().to_string())
                }
                RunOutcome::Interrupted(_) => Err(AgentError::ToolExecution(format!(
                    "subagent '{}' stopped for approval",
                    entry.name
                ))),
            }
        })
    }
}
