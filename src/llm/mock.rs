//! Scripted 模型（用于测试与本地演示，无需 API）
//!
//! 两种模式：按顺序吐出预先写好的回复；或由闭包根据收到的消息决定回复。
//! 每次调用收到的消息都被记录下来，便于测试断言模型实际看到的上下文。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::llm::{ModelClient, ModelResponse};
use crate::memory::{Message, Role};
use crate::tools::ToolInfo;

type Responder = Box<dyn Fn(&[Message], &[ToolInfo]) -> Result<ModelResponse, AgentError> + Send + Sync>;

enum Script {
    Queue(Mutex<VecDeque<Result<ModelResponse, AgentError>>>),
    Func(Responder),
}

pub struct ScriptedModel {
    script: Script,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    /// 按顺序返回；脚本耗尽后回复 "Done."
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    /// 允许在脚本中注入调用失败
    pub fn with_results(responses: Vec<Result<ModelResponse, AgentError>>) -> Self {
        Self {
            script: Script::Queue(Mutex::new(responses.into())),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&[Message], &[ToolInfo]) -> Result<ModelResponse, AgentError> + Send + Sync + 'static,
    {
        Self {
            script: Script::Func(Box::new(f)),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 回显最后一条用户消息（provider = "mock" 时使用）
    pub fn echo() -> Self {
        Self::from_fn(|messages, _| {
            let last = messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str())
                .unwrap_or("(no input)");
            Ok(ModelResponse::text(format!("Echo: {last}")))
        })
    }

    /// 已收到的全部请求（每个元素为一次调用的消息列表）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn invoke(&self, messages: &[Message], tools: &[ToolInfo]) -> Result<ModelResponse, AgentError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        match &self.script {
            Script::Queue(queue) => {
                let next = queue
                    .lock()
                    .map_err(|_| AgentError::ModelInvocation("script lock poisoned".to_string()))?
                    .pop_front();
                next.unwrap_or_else(|| Ok(ModelResponse::text("Done.")))
            }
            Script::Func(f) => f(messages, tools),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_then_default() {
        let model = ScriptedModel::new(vec![ModelResponse::text("first")]);
        let msgs = vec![Message::user("hi")];
        assert_eq!(model.invoke(&msgs, &[]).await.unwrap().content, "first");
        assert_eq!(model.invoke(&msgs, &[]).await.unwrap().content, "Done.");
        assert_eq!(model.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let model = ScriptedModel::with_results(vec![Err(AgentError::ModelInvocation("503".into()))]);
        let err = model.invoke(&[Message::user("hi")], &[]).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_echo() {
        let model = ScriptedModel::echo();
        let out = model.invoke(&[Message::user("ping")], &[]).await.unwrap();
        assert_eq!(out.content, "Echo: ping");
    }
}
