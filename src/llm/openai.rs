//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。请求与响应走 byot（自带 JSON），
//! 以便直接收发 function calling 的 tool_calls；工具定义经 `to_function_schema` 转换。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::Client;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::llm::{ModelClient, ModelResponse};
use crate::memory::{Message, Role, ToolCall};
use crate::tools::{to_function_schema, ToolInfo};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
        )
    }
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    request_timeout: Duration,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>, request_timeout: Duration) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();

        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            request_timeout,
            usage: TokenUsage::default(),
        }
    }

    fn build_request(&self, messages: &[Message], tools: &[ToolInfo]) -> Value {
        let mut request = json!({
            "model": self.model,
            "messages": messages.iter().map(message_to_json).collect::<Vec<_>>(),
        });
        if !tools.is_empty() {
            request["tools"] = Value::Array(tools.iter().map(to_function_schema).collect());
        }
        request
    }
}

fn message_to_json(m: &Message) -> Value {
    match m.role {
        Role::Assistant if m.has_tool_calls() => {
            let calls: Vec<Value> = m
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {"name": c.name, "arguments": c.args.to_string()},
                    })
                })
                .collect();
            let content = if m.content.is_empty() {
                Value::Null
            } else {
                Value::String(m.content.clone())
            };
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
            "content": m.content,
        }),
        role => json!({"role": role.as_str(), "content": m.content}),
    }
}

/// 解析 chat completion 响应；工具参数不是合法 JSON 时以原始字符串包装
fn parse_response(body: &Value) -> Result<ModelResponse, AgentError> {
    let message = body
        .pointer("/choices/0/message")
        .ok_or_else(|| AgentError::ModelInvocation("response has no choices".to_string()))?;
    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| {
                    let id = c.get("id").and_then(Value::as_str).unwrap_or_default();
                    let name = c.pointer("/function/name")?.as_str()?;
                    let raw = c
                        .pointer("/function/arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("{}");
                    let args = serde_json::from_str(raw).unwrap_or_else(|_| json!({"raw": raw}));
                    Some(ToolCall::new(id, name, args))
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(ModelResponse { content, tool_calls })
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn invoke(&self, messages: &[Message], tools: &[ToolInfo]) -> Result<ModelResponse, AgentError> {
        let request = self.build_request(messages, tools);
        let chat = self.client.chat();
        let call = chat.create_byot::<Value, Value>(request);
        let body = tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| {
                AgentError::ModelInvocation(format!(
                    "request timed out after {}s",
                    self.request_timeout.as_secs()
                ))
            })?
            .map_err(|e| AgentError::ModelInvocation(e.to_string()))?;

        if let Some(usage) = body.get("usage") {
            let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
            let completion = usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
            self.usage.add(prompt, completion);
            tracing::debug!(model = %self.model, prompt, completion, "token usage");
        }
        parse_response(&body)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_calls() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "execute_command", "arguments": "{\"command\":\"df -h\"}"}
                    }]
                }
            }]
        });
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.content, "");
        assert_eq!(resp.tool_calls[0].id, "call_1");
        assert_eq!(resp.tool_calls[0].args["command"], "df -h");
    }

    #[test]
    fn test_parse_without_choices_fails() {
        assert!(parse_response(&json!({"choices": []})).is_err());
    }

    #[test]
    fn test_tool_message_shape() {
        let v = message_to_json(&Message::tool("call_1", "ok"));
        assert_eq!(v["role"], "tool");
        assert_eq!(v["tool_call_id"], "call_1");
    }

    #[test]
    fn test_request_includes_tools() {
        let client = OpenAiClient::new(None, "gpt-4o-mini", Some("sk-test"), Duration::from_secs(5));
        let req = client.build_request(
            &[Message::user("hi")],
            &[ToolInfo::new("ls", "list", json!({"type": "object"}))],
        );
        assert_eq!(req["tools"][0]["function"]["name"], "ls");
        assert_eq!(req["messages"][0]["role"], "user");
    }
}
