//! 核心层：错误分类、进程级上下文、运行时入口

pub mod context;
pub mod error;
pub mod runtime;

pub use context::{AppContext, ContextParts};
pub use error::{AgentError, ErrorClass};
pub use runtime::{AgentRuntime, RunHandle};
