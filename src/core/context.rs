//! 进程级上下文
//!
//! 持久化客户端、工具连接管理器、模型客户端与执行图在启动时构建一次，之后注入运行时；
//! 不使用任何全局可变状态。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, GraphVariant, LlmSection};
use crate::core::AgentError;
use crate::graph::{deep_graph, reflection_graph, EngineSettings, Graph, GraphEngine};
use crate::llm::{ModelClient, OpenAiClient, ScriptedModel};
use crate::memory::{
    CheckpointSaver, ContextWindowManager, MemoryStateStore, SqliteCheckpointBackend, SqliteDb,
    SqliteStateStore, StateStore,
};
use crate::tools::{
    ReadFileTool, SafeFs, ShellTool, StdioLauncher, ToolConnectionManager, ToolExecutor,
    ToolRegistry, WriteFileTool,
};

const DB_FILE: &str = "hive.db";

pub struct AppContext {
    pub config: AppConfig,
    pub engine: Arc<GraphEngine>,
    pub graph: Arc<Graph>,
    pub store: Arc<dyn StateStore>,
    pub connections: ToolConnectionManager,
}

/// 各依赖的组装参数；测试与嵌入场景可替换其中任意一项
pub struct ContextParts {
    pub model: Arc<dyn ModelClient>,
    pub registry: ToolRegistry,
    pub connections: ToolConnectionManager,
    pub store: Arc<dyn StateStore>,
    pub checkpoints: Arc<CheckpointSaver>,
}

impl ContextParts {
    /// 内存存储、无外部提供方、无本地工具
    pub fn in_memory(model: Arc<dyn ModelClient>) -> Self {
        Self {
            model,
            registry: ToolRegistry::new(),
            connections: ToolConnectionManager::new(Arc::new(StdioLauncher::new(Duration::from_secs(
                10,
            )))),
            store: Arc::new(MemoryStateStore::new()),
            checkpoints: Arc::new(CheckpointSaver::in_memory()),
        }
    }
}

impl AppContext {
    /// 按配置构建；配置非法时在创建任何状态之前失败
    pub async fn from_config(config: AppConfig, workspace: impl AsRef<Path>) -> Result<Self, AgentError> {
        config.validate()?;

        let (store, checkpoints): (Arc<dyn StateStore>, Arc<CheckpointSaver>) =
            match &config.app.data_dir {
                Some(dir) => {
                    let db = SqliteDb::open(dir.join(DB_FILE))?;
                    tracing::info!(path = %dir.join(DB_FILE).display(), "using sqlite persistence");
                    (
                        Arc::new(SqliteStateStore::new(db.clone())),
                        Arc::new(CheckpointSaver::new(Arc::new(SqliteCheckpointBackend::new(db)))),
                    )
                }
                None => {
                    tracing::info!("no data_dir configured, threads are kept in memory");
                    (
                        Arc::new(MemoryStateStore::new()),
                        Arc::new(CheckpointSaver::in_memory()),
                    )
                }
            };

        let fs = SafeFs::new(workspace);
        let mut registry = ToolRegistry::new();
        registry.register(ShellTool::new(config.tools.shell.allowed_commands.clone()));
        registry.register(ReadFileTool::new(fs.clone()));
        registry.register(WriteFileTool::new(fs));

        let connections = ToolConnectionManager::new(Arc::new(StdioLauncher::new(Duration::from_secs(
            config.tools.timeout_secs,
        ))));
        for (id, result) in connections.connect_all(&config.tools.providers).await {
            if let Err(e) = result {
                tracing::warn!(provider = %id, error = %e, "tool provider unavailable");
            }
        }

        let parts = ContextParts {
            model: build_model(&config.llm),
            registry,
            connections,
            store,
            checkpoints,
        };
        Self::from_parts(config, parts)
    }

    pub fn from_parts(config: AppConfig, parts: ContextParts) -> Result<Self, AgentError> {
        config.validate()?;
        let tools = ToolExecutor::new(
            parts.registry,
            parts.connections.clone(),
            config.tools.timeout_secs,
            config.tools.max_output_bytes,
        );
        let engine = GraphEngine::new(
            parts.model,
            Arc::new(tools),
            parts.checkpoints,
            ContextWindowManager::new(config.window.max_groups),
            EngineSettings::from_config(&config),
        )
        .with_subagents(config.subagents.clone());
        let graph = match config.engine.variant {
            GraphVariant::Reflection => reflection_graph()?,
            GraphVariant::Deep => deep_graph()?,
        };
        tracing::info!(
            variant = ?config.engine.variant,
            model = engine.model().model_name(),
            subagents = config.subagents.len(),
            "context ready"
        );
        Ok(Self {
            config,
            engine: Arc::new(engine),
            graph: Arc::new(graph),
            store: parts.store,
            connections: parts.connections,
        })
    }

    pub async fn shutdown(&self) {
        self.connections.disconnect_all().await;
    }
}

fn build_model(llm: &LlmSection) -> Arc<dyn ModelClient> {
    match llm.provider.to_lowercase().as_str() {
        "openai" => Arc::new(OpenAiClient::new(
            llm.base_url.as_deref(),
            &llm.model,
            None,
            Duration::from_secs(llm.request_timeout_secs),
        )),
        _ => Arc::new(ScriptedModel::echo()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_config_fails_before_building() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "openai".into();
        let dir = tempfile::TempDir::new().unwrap();
        cfg.app.data_dir = Some(dir.path().join("data"));
        assert!(AppContext::from_config(cfg, dir.path()).await.is_err());
        assert!(!dir.path().join("data").exists());
    }

    #[tokio::test]
    async fn test_sqlite_context() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = AppConfig::default();
        cfg.app.data_dir = Some(dir.path().to_path_buf());
        cfg.engine.variant = GraphVariant::Deep;
        let ctx = AppContext::from_config(cfg, dir.path()).await.unwrap();
        assert!(dir.path().join(DB_FILE).exists());
        assert_eq!(ctx.graph.entry(), "agent");
        let names: Vec<String> = ctx
            .engine
            .tools()
            .available_tools(None)
            .await
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["execute_command", "read_file", "write_file"]);
    }
}
