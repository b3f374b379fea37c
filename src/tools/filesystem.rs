//! 沙箱文件工具：read_file / write_file
//!
//! SafeFs 绑定工作目录，所有路径必须落在根目录下（禁止 ../ 逃逸）。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::AgentError;
use crate::tools::Tool;

/// 绑定根目录的沙箱文件系统
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    /// 词法解析相对路径（不要求文件存在），拒绝绝对路径与 `..`
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let rel = Path::new(path.trim_start_matches("./"));
        let mut out = self.root_dir.clone();
        for comp in rel.components() {
            match comp {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(AgentError::ToolExecution(format!(
                        "path escapes workspace: {path}"
                    )))
                }
            }
        }
        Ok(out)
    }

    pub async fn read(&self, path: &str) -> Result<String, AgentError> {
        let resolved = self.resolve(path)?;
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| AgentError::ToolExecution(format!("read {path}: {e}")))
    }

    pub async fn write(&self, path: &str, content: &str) -> Result<usize, AgentError> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::ToolExecution(format!("mkdir for {path}: {e}")))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| AgentError::ToolExecution(format!("write {path}: {e}")))?;
        Ok(content.len())
    }
}

/// read_file 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    /// 相对工作目录的路径
    pub path: String,
}

/// write_file 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteFileArgs {
    pub path: String,
    /// 完整文件内容（覆盖写入）
    pub content: String,
}

fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, args: Value) -> Result<T, AgentError> {
    serde_json::from_value(args)
        .map_err(|e| AgentError::ToolExecution(format!("invalid arguments for {tool}: {e}")))
}

pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(ReadFileArgs)).unwrap_or(Value::Null)
    }

    async fn execute(&self, args: Value) -> Result<String, AgentError> {
        let args: ReadFileArgs = parse_args(self.name(), args)?;
        self.fs.read(&args.path).await
    }
}

pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a text file in the workspace."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(WriteFileArgs)).unwrap_or(Value::Null)
    }

    async fn execute(&self, args: Value) -> Result<String, AgentError> {
        let args: WriteFileArgs = parse_args(self.name(), args)?;
        let n = self.fs.write(&args.path, &args.content).await?;
        tracing::info!(path = %args.path, bytes = n, "write_file");
        Ok(format!("Wrote {n} bytes to {}", args.path))
    }
}
