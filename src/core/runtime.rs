//! 运行时：start / resume 的对外入口
//!
//! 请求先同步校验（失败时不触碰任何引擎状态），然后运行被放到独立的 tokio 任务里：
//! 运行的生命周期与事件投递解耦，调用方丢弃事件接收端不会中止运行，运行仍会完成、
//! 提交检查点并把最终回答写入线程。事件投递尽力而为。
//!
//! 同一线程同时只有一个运行；运行中的线程上再 start / resume 会在写入任何状态前被拒绝。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::{AgentError, AppContext};
use crate::graph::{trace_channel, ApprovalDecision, RunOutcome, TraceEntry, TraceSink};
use crate::memory::{Checkpoint, Message, StateStore, Thread, ThreadSummary, ToolCall};
use crate::stream::{StreamEvent, StreamTranslator};

const TITLE_CHARS: usize = 50;

enum RunRequest {
    Start(Message),
    Resume(Vec<ApprovalDecision>),
}

/// 一次运行的句柄
pub struct RunHandle {
    pub thread_id: String,
    /// 有序事件流，以 `done` 结束
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
    /// 运行本身；不依赖 events 是否被消费
    pub completion: JoinHandle<Result<RunOutcome, AgentError>>,
}

impl RunHandle {
    /// 读完全部事件并等待运行结束
    pub async fn collect(mut self) -> (Vec<StreamEvent>, Result<RunOutcome, AgentError>) {
        let mut events = Vec::new();
        while let Some(ev) = self.events.recv().await {
            events.push(ev);
        }
        let outcome = self
            .completion
            .await
            .unwrap_or_else(|e| Err(AgentError::persistence(format!("run task aborted: {e}"))));
        (events, outcome)
    }
}

/// 正在运行的线程
#[derive(Clone, Default)]
struct ActiveRuns(Arc<Mutex<HashSet<String>>>);

impl ActiveRuns {
    fn claim(&self, thread_id: &str) -> Result<RunClaim, AgentError> {
        let mut active = self
            .0
            .lock()
            .map_err(|_| AgentError::persistence("active run table poisoned"))?;
        if !active.insert(thread_id.to_string()) {
            return Err(AgentError::validation(format!(
                "thread '{thread_id}' already has a run in progress"
            )));
        }
        Ok(RunClaim {
            runs: self.clone(),
            thread_id: thread_id.to_string(),
        })
    }
}

/// 线程占用；析构时释放
struct RunClaim {
    runs: ActiveRuns,
    thread_id: String,
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        if let Ok(mut active) = self.runs.0.lock() {
            active.remove(&self.thread_id);
        }
    }
}

/// 克隆共享同一张运行表
#[derive(Clone)]
pub struct AgentRuntime {
    ctx: Arc<AppContext>,
    active: ActiveRuns,
}

impl AgentRuntime {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            active: ActiveRuns::default(),
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub async fn start(&self, thread_id: &str, input: &str) -> Result<RunHandle, AgentError> {
        if thread_id.trim().is_empty() {
            return Err(AgentError::validation("thread id must not be empty"));
        }
        if input.trim().is_empty() {
            return Err(AgentError::validation("input must not be empty"));
        }
        let claim = self.active.claim(thread_id)?;
        self.ctx.engine.prepare_start(thread_id).await?;

        let title: String = input.chars().take(TITLE_CHARS).collect();
        self.ctx
            .store
            .create_thread(thread_id, &title, self.ctx.engine.model().model_name())
            .await?;
        let message = Message::user(input);
        self.ctx.store.append_message(thread_id, message.clone()).await?;
        Ok(self.spawn(claim, RunRequest::Start(message), Vec::new()))
    }

    pub async fn resume(
        &self,
        thread_id: &str,
        decisions: Vec<ApprovalDecision>,
    ) -> Result<RunHandle, AgentError> {
        let claim = self.active.claim(thread_id)?;
        let checkpoint = self.ctx.engine.prepare_resume(thread_id, &decisions).await?;
        self.ctx
            .store
            .create_thread(thread_id, thread_id, self.ctx.engine.model().model_name())
            .await?;
        // 上一段已发出 subagent-start、尚无结果的委派
        let open_calls = checkpoint.state.pending_calls();
        Ok(self.spawn(claim, RunRequest::Resume(decisions), open_calls))
    }

    pub async fn history(&self, thread_id: &str, limit: usize) -> Result<Vec<Checkpoint>, AgentError> {
        self.ctx.engine.history(thread_id, limit).await
    }

    pub async fn threads(&self, limit: usize) -> Result<Vec<ThreadSummary>, AgentError> {
        self.ctx.store.list_threads(limit).await
    }

    pub async fn thread(&self, thread_id: &str) -> Result<Option<Thread>, AgentError> {
        self.ctx.store.get_thread(thread_id).await
    }

    fn spawn(&self, claim: RunClaim, request: RunRequest, open_calls: Vec<ToolCall>) -> RunHandle {
        let thread_id = claim.thread_id.clone();
        let (sink, trace_rx) = trace_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward(
            thread_id.clone(),
            self.ctx.store.clone(),
            open_calls,
            trace_rx,
            tx,
        ));

        let ctx = self.ctx.clone();
        let tid = thread_id.clone();
        let completion = tokio::spawn(async move {
            let result = run(&ctx, &tid, request, &sink).await;
            if let Err(e) = &result {
                tracing::error!(thread_id = %tid, error = %e, "run failed");
                sink.emit(TraceEntry::Failed {
                    message: e.to_string(),
                });
            }
            // 关闭轨迹通道，转发任务随之发出 done
            drop(sink);
            if let Err(e) = forwarder.await {
                tracing::warn!(thread_id = %tid, error = %e, "event forwarder stopped abnormally");
            }
            drop(claim);
            result
        });

        RunHandle {
            thread_id,
            events: rx,
            completion,
        }
    }
}

async fn run(
    ctx: &AppContext,
    thread_id: &str,
    request: RunRequest,
    sink: &TraceSink,
) -> Result<RunOutcome, AgentError> {
    let outcome = match request {
        RunRequest::Start(input) => ctx.engine.start(&ctx.graph, thread_id, input, sink).await?,
        RunRequest::Resume(decisions) => {
            ctx.engine.resume(&ctx.graph, thread_id, decisions, sink).await?
        }
    };
    if let RunOutcome::Completed(state) = &outcome {
        if let Some(text) = state.last_assistant_text() {
            ctx.store
                .append_message(thread_id, Message::assistant(text))
                .await?;
        }
    }
    Ok(outcome)
}

/// 轨迹 → 事件；todo-update 立即持久化，投递失败只记录一次
async fn forward(
    thread_id: String,
    store: Arc<dyn StateStore>,
    open_calls: Vec<ToolCall>,
    mut trace_rx: mpsc::UnboundedReceiver<TraceEntry>,
    tx: mpsc::UnboundedSender<StreamEvent>,
) {
    let mut translator = StreamTranslator::new(thread_id.clone());
    translator.reopen(&open_calls);
    let mut detached = false;
    let mut deliver = |ev: StreamEvent| {
        if !detached && tx.send(ev).is_err() {
            detached = true;
            tracing::info!(thread_id = %thread_id, "event receiver dropped, run continues detached");
        }
    };

    while let Some(entry) = trace_rx.recv().await {
        for ev in translator.translate(entry) {
            if let StreamEvent::TodoUpdate { todos } = &ev {
                if let Err(e) = store.set_todos(&thread_id, todos.clone()).await {
                    tracing::warn!(thread_id = %thread_id, error = %e, "todo persistence failed");
                }
            }
            deliver(ev);
        }
    }
    for ev in translator.finish() {
        deliver(ev);
    }
}
