//! 工具执行器
//!
//! 先查本地 ToolRegistry，再查已连接提供方的工具目录；每次调用施加超时并截断过长输出。
//! 无论成功、失败还是超时都返回 ToolResult（失败以 "Error: " 开头），从不让工具错误中止运行；
//! 每次调用输出一条结构化审计日志（JSON）。

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::memory::{ToolCall, ToolResult};
use crate::tools::{ToolConnectionManager, ToolInfo, ToolRegistry};

pub struct ToolExecutor {
    registry: ToolRegistry,
    connections: ToolConnectionManager,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ToolExecutor {
    pub fn new(
        registry: ToolRegistry,
        connections: ToolConnectionManager,
        timeout_secs: u64,
        max_output_bytes: usize,
    ) -> Self {
        Self {
            registry,
            connections,
            timeout: Duration::from_secs(timeout_secs),
            max_output_bytes,
        }
    }

    pub fn connections(&self) -> &ToolConnectionManager {
        &self.connections
    }

    /// 可用工具描述：本地工具在前，外部提供方在后；`only` 非空时按名过滤
    pub async fn available_tools(&self, only: Option<&[String]>) -> Vec<ToolInfo> {
        let mut seen = HashSet::new();
        let mut infos: Vec<ToolInfo> = self
            .registry
            .infos()
            .into_iter()
            .chain(self.connections.catalog().await)
            .filter(|t| seen.insert(t.name.clone()))
            .collect();
        if let Some(names) = only {
            infos.retain(|t| names.iter().any(|n| n == &t.name));
        }
        infos
    }

    async fn dispatch(&self, name: &str, args: Value) -> Result<String, AgentError> {
        if let Some(tool) = self.registry.get(name) {
            return tool.execute(args).await;
        }
        match self.connections.find_tool(name).await {
            Some(provider) => self.connections.execute_tool(&provider, name, args).await,
            None => Err(AgentError::ToolExecution(format!("unknown tool: {name}"))),
        }
    }

    /// 执行一次工具调用，总是返回结果
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let start = Instant::now();
        let preview = args_preview(&call.args);
        let result = timeout(self.timeout, self.dispatch(&call.name, call.args.clone())).await;

        let (ok, outcome) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.name,
            "tool_call_id": call.id,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(Ok(output)) => {
                let (output, truncated) = truncate_output(output, self.max_output_bytes);
                ToolResult {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    output,
                    truncated,
                }
            }
            Ok(Err(e)) => ToolResult::error(&call.id, &call.name, e),
            Err(_) => ToolResult::error(
                &call.id,
                &call.name,
                AgentError::ToolTimeout(format!("{} after {}s", call.name, self.timeout.as_secs())),
            ),
        }
    }
}

/// 超过上限时在 UTF-8 字符边界截断，并追加截断标记与原始长度
pub fn truncate_output(output: String, max_bytes: usize) -> (String, bool) {
    if max_bytes == 0 || output.len() <= max_bytes {
        return (output, false);
    }
    let mut cut = max_bytes;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    let original = output.len();
    let mut truncated = output[..cut].to_string();
    truncated.push_str(&format!("\n...[truncated] (original length: {original} bytes)"));
    (truncated, true)
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::tools::connection::{LaunchSpec, ProviderLauncher, ToolProvider};
    use crate::tools::Tool;

    struct Sleepy;

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn description(&self) -> &str {
            "Sleeps"
        }

        async fn execute(&self, _args: Value) -> Result<String, AgentError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("woke".into())
        }
    }

    struct Loud;

    #[async_trait]
    impl Tool for Loud {
        fn name(&self) -> &str {
            "loud"
        }

        fn description(&self) -> &str {
            "Prints a lot"
        }

        async fn execute(&self, _args: Value) -> Result<String, AgentError> {
            Ok("é".repeat(100))
        }
    }

    struct NoLauncher;

    #[async_trait]
    impl ProviderLauncher for NoLauncher {
        async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ToolProvider>, AgentError> {
            Err(AgentError::Connection(spec.id.clone()))
        }
    }

    fn executor(timeout_secs: u64) -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(Sleepy);
        registry.register(Loud);
        ToolExecutor::new(registry, ToolConnectionManager::new(Arc::new(NoLauncher)), timeout_secs, 51)
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        let (out, truncated) = truncate_output("é".repeat(10), 5);
        assert!(truncated);
        assert!(out.starts_with("éé"));
        assert!(out.ends_with("...[truncated] (original length: 20 bytes)"));
        let (same, t) = truncate_output("short".into(), 10);
        assert_eq!(same, "short");
        assert!(!t);
    }

    #[tokio::test]
    async fn test_long_output_is_marked_truncated() {
        let result = executor(5)
            .execute(&ToolCall::new("c1", "loud", Value::Null))
            .await;
        assert!(result.truncated);
        assert!(result.output.contains("original length: 200 bytes"));
    }

    #[tokio::test]
    async fn test_timeout_becomes_error_result() {
        let result = executor(1)
            .execute(&ToolCall::new("c1", "sleepy", Value::Null))
            .await;
        assert!(result.is_error());
        assert!(result.output.contains("timeout"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let result = executor(1)
            .execute(&ToolCall::new("c9", "nope", Value::Null))
            .await;
        assert_eq!(result.tool_call_id, "c9");
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn test_available_tools_filter() {
        let exec = executor(1);
        assert_eq!(exec.available_tools(None).await.len(), 2);
        let only = vec!["loud".to_string()];
        let filtered = exec.available_tools(Some(only.as_slice())).await;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "loud");
    }
}
