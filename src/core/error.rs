//! Agent 错误类型与错误分类
//!
//! 与引擎配合：致命错误（模型调用、持久化、校验、配置）中止本次运行并以 `error` 事件上报；
//! 可恢复错误（工具执行、工具超时、连接失败、解析失败）在本地转为工具结果或保守的回退决策。

use thiserror::Error;

/// Agent 运行过程中可能出现的错误
///
/// 所有载荷都是字符串，因此可以 Clone：同一个进行中的连接 future 会被多个调用方共享结果。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// 模型调用本身失败（网络 / 提供方）
    #[error("Model invocation failed: {0}")]
    ModelInvocation(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 工具提供方连接失败（启动命令不可用、握手失败等）
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Tool provider '{0}' is not connected")]
    NotConnected(String),

    /// 结构化输出（计划 / 批判 JSON）无法解析
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// 非法的恢复决策、线程状态不匹配等客户端错误
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// 错误分类（对应设计文档中的错误分类法）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ModelInvocation,
    ToolExecution,
    Connection,
    Parse,
    Persistence,
    Validation,
}

impl AgentError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AgentError::ModelInvocation(_) => ErrorClass::ModelInvocation,
            AgentError::ToolExecution(_) | AgentError::ToolTimeout(_) => ErrorClass::ToolExecution,
            AgentError::Connection(_) | AgentError::NotConnected(_) => ErrorClass::Connection,
            AgentError::Parse(_) => ErrorClass::Parse,
            AgentError::Persistence(_) => ErrorClass::Persistence,
            AgentError::Validation(_) | AgentError::Config(_) => ErrorClass::Validation,
        }
    }

    /// 是否终止当前运行
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::ModelInvocation | ErrorClass::Persistence | ErrorClass::Validation
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AgentError::Validation(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        AgentError::Persistence(msg.into())
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Persistence(format!("serialization: {e}"))
    }
}
