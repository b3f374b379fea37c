//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ENGINE__MAX_ITERATIONS=40`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::core::AgentError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub engine: EngineSection,
    pub window: WindowSection,
    pub tools: ToolsSection,
    pub subagents: Vec<SubagentEntry>,
    pub web: WebSection,
}

/// [app] 段：应用名、数据目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// SQLite 数据目录；未设置时线程与检查点只保存在内存中
    pub data_dir: Option<PathBuf>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: String::new(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

/// 执行图变体
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GraphVariant {
    /// planner → generate ⇄ tools → reflect → revise / final
    #[default]
    Reflection,
    /// 编排器 + 子智能体委派
    Deep,
}

/// [engine] 段：迭代预算、状态上限、审批策略
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// 单次运行的节点访问上限
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// ExecutionState 中保留的消息上限
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// 工具结果环形缓冲大小
    #[serde(default = "default_max_tool_results")]
    pub max_tool_results: usize,
    #[serde(default)]
    pub variant: GraphVariant,
    /// 为 true 时跳过所有人工审批
    #[serde(default)]
    pub auto_approve: bool,
    /// 需要人工审批的工具名
    #[serde(default = "default_interrupt_on")]
    pub interrupt_on: Vec<String>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_messages: default_max_messages(),
            max_tool_results: default_max_tool_results(),
            variant: GraphVariant::default(),
            auto_approve: false,
            interrupt_on: default_interrupt_on(),
        }
    }
}

fn default_max_iterations() -> usize {
    25
}

fn default_max_messages() -> usize {
    200
}

fn default_max_tool_results() -> usize {
    50
}

fn default_interrupt_on() -> Vec<String> {
    vec!["execute_command".into(), "write_file".into()]
}

/// [window] 段：送入模型的上下文窗口大小（以「组」计：一条普通消息或一组 tool call + 结果）
#[derive(Debug, Clone, Deserialize)]
pub struct WindowSection {
    #[serde(default = "default_max_groups")]
    pub max_groups: usize,
}

impl Default for WindowSection {
    fn default() -> Self {
        Self {
            max_groups: default_max_groups(),
        }
    }
}

fn default_max_groups() -> usize {
    20
}

/// [tools] 段：超时、输出截断、Shell 白名单、外部工具提供方
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// 工具输出超过该字节数时截断
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub shell: ShellSection,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            shell: ShellSection::default(),
            providers: Vec::new(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_max_output_bytes() -> usize {
    20_000
}

/// [tools.shell] 段：允许执行的命令名（仅首词）
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    vec![
        "ls".into(),
        "cat".into(),
        "grep".into(),
        "df".into(),
        "du".into(),
        "ps".into(),
        "uptime".into(),
        "kubectl".into(),
        "aws".into(),
        "rm".into(),
    ]
}

/// [web] 段：hive-web 监听端口
#[derive(Debug, Clone, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            port: default_web_port(),
        }
    }
}

fn default_web_port() -> u16 {
    8080
}

/// [[tools.providers]]：以长连接子进程方式启动的外部工具提供方
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// [[subagents]]：可被编排器委派的子智能体
#[derive(Debug, Clone, Deserialize)]
pub struct SubagentEntry {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// 子智能体可用的工具名；为空表示全部非审批工具
    #[serde(default)]
    pub tools: Vec<String>,
}

impl AppConfig {
    /// 启动前校验必需配置，失败时不触碰任何引擎状态
    pub fn validate(&self) -> Result<(), AgentError> {
        match self.llm.provider.to_lowercase().as_str() {
            "mock" => {}
            "openai" => {
                if self.llm.model.trim().is_empty() {
                    return Err(AgentError::Config(
                        "llm.model is required for provider 'openai'".to_string(),
                    ));
                }
            }
            other => {
                return Err(AgentError::Config(format!("unknown llm.provider '{other}'")));
            }
        }
        if self.engine.max_iterations == 0 {
            return Err(AgentError::Config("engine.max_iterations must be > 0".to_string()));
        }
        if self.window.max_groups == 0 {
            return Err(AgentError::Config("window.max_groups must be >= 1".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for p in &self.tools.providers {
            if !seen.insert(p.id.as_str()) {
                return Err(AgentError::Config(format!("duplicate provider id '{}'", p.id)));
            }
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.engine.max_iterations, 25);
        assert!(!cfg.engine.auto_approve);
        assert!(cfg.engine.interrupt_on.contains(&"execute_command".to_string()));
    }

    #[test]
    fn test_openai_requires_model() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "openai".to_string();
        assert!(matches!(cfg.validate(), Err(AgentError::Config(_))));
        cfg.llm.model = "gpt-4o-mini".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let mut cfg = AppConfig::default();
        let entry = ProviderEntry {
            id: "k8s".into(),
            command: "npx".into(),
            args: vec![],
            env: HashMap::new(),
        };
        cfg.tools.providers = vec![entry.clone(), entry];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            r#"
[engine]
max_iterations = 7
variant = "deep"

[[subagents]]
name = "researcher"
description = "Looks things up"
tools = ["search"]
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.engine.max_iterations, 7);
        assert_eq!(cfg.engine.variant, GraphVariant::Deep);
        assert_eq!(cfg.subagents.len(), 1);
        assert_eq!(cfg.subagents[0].tools, vec!["search".to_string()]);
    }
}
