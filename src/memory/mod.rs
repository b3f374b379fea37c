//! 记忆层：对话模型、线程存储、检查点与写日志、上下文窗口

pub mod checkpoint;
pub mod conversation;
pub mod sqlite;
pub mod store;
pub mod window;

pub use checkpoint::{
    Checkpoint, CheckpointBackend, CheckpointSaver, MemoryCheckpointBackend, PendingWrite,
    RunStatus, SqliteCheckpointBackend,
};
pub use conversation::{
    pending_tool_calls, Message, Role, Todo, TodoStatus, ToolCall, ToolResult,
};
pub use sqlite::SqliteDb;
pub use store::{MemoryStateStore, SqliteStateStore, StateStore, Thread, ThreadSummary};
pub use window::{sanitize_tool_pairs, ContextWindowManager};
