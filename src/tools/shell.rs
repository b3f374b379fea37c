//! execute_command：白名单 Shell 命令
//!
//! 仅允许配置中的命令名（首词，如 ls、df、kubectl）；禁止 mkfs、fork bomb 等子串。
//! 是否需要人工审批由引擎的 interrupt_on 决定，这里只做最后一道白名单校验。

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::core::AgentError;
use crate::tools::Tool;

/// 即使命令名在白名单内也不允许出现的子串
const FORBIDDEN_SUBSTR: &[&str] = &[
    "mkfs",
    "dd if=",
    "> /dev/sd",
    "chmod 777",
    "curl | sh",
    ":(){ :|:& };:", // fork bomb
];

pub struct ShellTool {
    allowed_commands: HashSet<String>,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self { allowed_commands }
    }

    fn check(&self, raw: &str) -> Result<(), AgentError> {
        let lower = raw.to_lowercase();
        if let Some(forbidden) = FORBIDDEN_SUBSTR.iter().find(|f| lower.contains(*f)) {
            return Err(AgentError::ToolExecution(format!("forbidden pattern: {forbidden}")));
        }
        let name = lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err(AgentError::ToolExecution("empty command".to_string()));
        }
        if !self.allowed_commands.contains(name) {
            return Err(AgentError::ToolExecution(format!(
                "command '{name}' is not in the allowlist"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Run a shell command on the operator host. Only allowlisted commands are accepted."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, AgentError> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        self.check(command)?;

        tracing::info!(command = %command, "execute_command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| AgentError::ToolExecution(format!("spawn failed: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(AgentError::ToolExecution(format!(
                "exit {:?}\nstderr: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(if stderr.trim().is_empty() {
            stdout
        } else {
            format!("{}\nstderr: {}", stdout.trim(), stderr.trim())
        })
    }
}
