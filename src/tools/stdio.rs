//! stdio 工具提供方：子进程 + 换行分隔的 JSON-RPC 2.0
//!
//! 握手：`initialize` → `notifications/initialized`；之后用 `tools/list` 发现工具、`tools/call` 调用。
//! 请求在一把锁内串行收发，响应前的非 JSON 行（提供方的日志输出）被跳过。

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::core::AgentError;
use crate::tools::connection::{LaunchSpec, ProviderLauncher, ToolProvider};
use crate::tools::ToolInfo;

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

struct Transport {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// 通过子进程 stdio 通信的提供方
pub struct StdioProvider {
    id: String,
    transport: Mutex<Transport>,
    next_id: AtomicU64,
    response_timeout: Duration,
}

impl StdioProvider {
    async fn spawn(spec: &LaunchSpec, response_timeout: Duration) -> Result<Self, AgentError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| {
            AgentError::Connection(format!(
                "failed to spawn provider '{}' ({}): {e}",
                spec.id, spec.command
            ))
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            AgentError::Connection(format!("provider '{}': stdin unavailable", spec.id))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            AgentError::Connection(format!("provider '{}': stdout unavailable", spec.id))
        })?;
        let provider = Self {
            id: spec.id.clone(),
            transport: Mutex::new(Transport {
                child,
                stdin,
                stdout: BufReader::new(stdout),
            }),
            next_id: AtomicU64::new(1),
            response_timeout,
        };
        provider.handshake().await?;
        Ok(provider)
    }

    async fn handshake(&self) -> Result<(), AgentError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "hive", "version": env!("CARGO_PKG_VERSION")}
        });
        self.request("initialize", params).await?;
        let mut transport = self.transport.lock().await;
        let note = JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method: "notifications/initialized",
            params: serde_json::json!({}),
        };
        write_line(&mut transport.stdin, &note, &self.id).await
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, AgentError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut transport = self.transport.lock().await;
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: Some(id),
            method,
            params,
        };
        write_line(&mut transport.stdin, &req, &self.id).await?;

        let response = tokio::time::timeout(self.response_timeout, read_response(&mut transport.stdout, id))
            .await
            .map_err(|_| {
                AgentError::Connection(format!("provider '{}': timeout waiting for '{method}'", self.id))
            })??;
        if let Some(err) = response.error {
            return Err(AgentError::ToolExecution(format!(
                "provider '{}' {method} failed: code={} {}",
                self.id, err.code, err.message
            )));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

async fn write_line(stdin: &mut ChildStdin, msg: &JsonRpcRequest<'_>, id: &str) -> Result<(), AgentError> {
    let mut line = serde_json::to_string(msg)
        .map_err(|e| AgentError::Connection(format!("provider '{id}': encode request: {e}")))?;
    line.push('\n');
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| AgentError::Connection(format!("provider '{id}': write failed: {e}")))?;
    stdin
        .flush()
        .await
        .map_err(|e| AgentError::Connection(format!("provider '{id}': flush failed: {e}")))
}

async fn read_response(
    reader: &mut BufReader<ChildStdout>,
    expected: u64,
) -> Result<JsonRpcResponse, AgentError> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| AgentError::Connection(format!("read failed: {e}")))?;
        if n == 0 {
            return Err(AgentError::Connection("provider closed stdout".to_string()));
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
            Ok(resp) if resp.id == Some(expected) => return Ok(resp),
            _ => continue,
        }
    }
}

/// tools/call 结果中的文本内容拼接
fn call_result_text(result: &Value) -> (String, bool) {
    let is_error = result.get("isError").and_then(Value::as_bool).unwrap_or(false);
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_else(|| result.to_string());
    (text, is_error)
}

#[async_trait]
impl ToolProvider for StdioProvider {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, AgentError> {
        let result = self.request("tools/list", serde_json::json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .into_iter()
            .filter_map(|t| {
                let name = t.get("name")?.as_str()?.to_string();
                let description = t
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let schema = t
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"}));
                Some(ToolInfo::new(name, description, schema))
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<String, AgentError> {
        let result = self
            .request("tools/call", serde_json::json!({"name": name, "arguments": args}))
            .await?;
        let (text, is_error) = call_result_text(&result);
        if is_error {
            return Err(AgentError::ToolExecution(text));
        }
        Ok(text)
    }

    async fn shutdown(&self) -> Result<(), AgentError> {
        let mut transport = self.transport.lock().await;
        transport
            .child
            .kill()
            .await
            .map_err(|e| AgentError::Connection(format!("provider '{}': kill failed: {e}", self.id)))
    }
}

/// 默认启动器：spawn 子进程并完成握手
#[derive(Debug, Clone)]
pub struct StdioLauncher {
    response_timeout: Duration,
}

impl StdioLauncher {
    pub fn new(response_timeout: Duration) -> Self {
        Self { response_timeout }
    }
}

#[async_trait]
impl ProviderLauncher for StdioLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ToolProvider>, AgentError> {
        tracing::info!(provider = %spec.id, command = %spec.command, "launching tool provider");
        let provider = StdioProvider::spawn(spec, self.response_timeout).await?;
        Ok(Arc::new(provider))
    }
}
