//! 引擎的原始执行轨迹
//!
//! 每个节点提交后发出一条 `Update`；命名空间为空表示根图，非空表示嵌套的子智能体运行。
//! 发送是尽力而为的：接收端断开不影响运行。

use tokio::sync::mpsc;

use crate::graph::{ApprovalRequest, StateUpdate};

/// 产生轨迹的（可能嵌套的）子图路径
pub type Namespace = Vec<String>;

#[derive(Debug, Clone)]
pub enum TraceEntry {
    Update {
        namespace: Namespace,
        node: String,
        update: StateUpdate,
    },
    Interrupt {
        namespace: Namespace,
        request: ApprovalRequest,
    },
    /// 致命错误；之后不会再有条目
    Failed { message: String },
}

/// 轨迹发送端
#[derive(Debug, Clone, Default)]
pub struct TraceSink {
    tx: Option<mpsc::UnboundedSender<TraceEntry>>,
}

impl TraceSink {
    pub fn new(tx: mpsc::UnboundedSender<TraceEntry>) -> Self {
        Self { tx: Some(tx) }
    }

    /// 丢弃所有轨迹
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, entry: TraceEntry) {
        if let Some(tx) = &self.tx {
            if tx.send(entry).is_err() {
                tracing::debug!("trace receiver dropped; continuing without live delivery");
            }
        }
    }
}

pub fn trace_channel() -> (TraceSink, mpsc::UnboundedReceiver<TraceEntry>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TraceSink::new(tx), rx)
}
