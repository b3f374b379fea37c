//! 执行图：状态、节点、路由、引擎、审批与执行轨迹

pub mod approval;
pub mod builder;
pub mod engine;
pub mod node;
pub mod state;
pub mod trace;

pub use approval::{ActionRequest, ApprovalDecision, ApprovalRequest, DecisionType, ReviewConfig};
pub use builder::{deep_graph, reflection_graph, subagent_graph, Budget, Graph, GraphBuilder, Route};
pub use engine::{EngineSettings, GraphEngine, RunOutcome};
pub use node::{Node, NodeContext, ToolAccess, ToolScope};
pub use state::{ExecutionState, StateLimits, StateUpdate};
pub use trace::{trace_channel, Namespace, TraceEntry, TraceSink};
