//! Hive - Rust 运维智能体执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量 HIVE__*）
//! - **core**: 错误分类、进程级上下文、运行时（start / resume）
//! - **graph**: 执行图、节点、路由、检查点驱动的引擎、人工审批
//! - **llm**: 模型客户端抽象与实现（OpenAI 兼容 / Scripted）
//! - **memory**: 对话模型、线程存储、检查点与写日志、上下文窗口
//! - **observability**: tracing 初始化
//! - **stream**: 执行轨迹到有序事件流的翻译
//! - **tools**: 工具注册表、执行器、外部提供方连接、内置工具

pub mod config;
pub mod core;
pub mod graph;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod stream;
pub mod tools;

pub use crate::core::{AgentError, AgentRuntime, AppContext, RunHandle};
pub use crate::stream::StreamEvent;
