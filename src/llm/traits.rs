//! 模型客户端抽象
//!
//! 模型调用被当作不透明函数：消息 + 可用工具 → 回复文本与（可能的）工具调用。
//! 所有后端（OpenAI 兼容 / Scripted Mock）实现 ModelClient。

use async_trait::async_trait;

use crate::core::AgentError;
use crate::memory::{Message, ToolCall};
use crate::tools::ToolInfo;

/// 一次模型调用的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
        }
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// 调用失败一律返回 ModelInvocation（致命）
    async fn invoke(&self, messages: &[Message], tools: &[ToolInfo]) -> Result<ModelResponse, AgentError>;

    fn model_name(&self) -> &str;
}
