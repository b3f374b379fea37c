//! 外部工具提供方连接管理
//!
//! 提供方以长连接子进程方式启动（不是每次调用都 spawn），进程级单例，由 AppContext 持有。
//! - connect_server 幂等：同一 id 的连接正在进行时，并发调用方等待同一个进行中的 future
//! - 启动命令在当前环境不可用时，按静态映射表换成等价的本地命令；没有等价命令则立即失败
//! - 连接成功后缓存该连接发现的工具目录

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, RwLock};

use crate::config::ProviderEntry;
use crate::core::AgentError;
use crate::tools::ToolInfo;

/// 已连接的提供方
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, AgentError>;

    async fn call_tool(&self, name: &str, args: serde_json::Value) -> Result<String, AgentError>;

    async fn shutdown(&self) -> Result<(), AgentError>;
}

/// 启动提供方（默认实现为 stdio 子进程）
#[async_trait]
pub trait ProviderLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ToolProvider>, AgentError>;
}

/// 判断命令在当前环境是否可执行
pub trait CommandProbe: Send + Sync {
    fn is_available(&self, command: &str) -> bool;
}

/// 在 PATH 中查找可执行文件
#[derive(Debug, Default, Clone)]
pub struct PathProbe;

impl CommandProbe for PathProbe {
    fn is_available(&self, command: &str) -> bool {
        let candidate = Path::new(command);
        if candidate.components().count() > 1 {
            return candidate.is_file();
        }
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(command).is_file()))
            .unwrap_or(false)
    }
}

/// 实际用于启动的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl From<&ProviderEntry> for LaunchSpec {
    fn from(entry: &ProviderEntry) -> Self {
        Self {
            id: entry.id.clone(),
            command: entry.command.clone(),
            args: entry.args.clone(),
            env: entry.env.clone(),
        }
    }
}

/// 包运行器启动的目标包 → 本地等价命令
const NATIVE_EQUIVALENTS: &[(&str, &str)] = &[
    ("awslabs.aws-api-mcp-server", "aws-api-mcp-server"),
    ("awslabs.cloudwatch-mcp-server", "cloudwatch-mcp-server"),
    ("awslabs.eks-mcp-server", "eks-mcp-server"),
    ("@modelcontextprotocol/server-filesystem", "mcp-server-filesystem"),
    ("@modelcontextprotocol/server-github", "mcp-server-github"),
    ("mcp-server-kubernetes", "kubernetes-mcp-server"),
    ("@grafana/mcp-grafana", "mcp-grafana"),
];

/// 去掉包名上的版本后缀：`pkg@1.2` / `@scope/pkg@latest`
fn strip_version(target: &str) -> &str {
    match target.rfind('@') {
        Some(idx) if idx > 0 => &target[..idx],
        _ => target,
    }
}

/// 解析可用的启动命令
///
/// 配置的命令可用时原样返回；否则取第一个非选项参数作为目标包查映射表，
/// 目标包之前的参数（包运行器自己的选项）被丢弃，之后的参数保留。
pub fn resolve_launch(spec: &LaunchSpec, probe: &dyn CommandProbe) -> Result<LaunchSpec, AgentError> {
    if probe.is_available(&spec.command) {
        return Ok(spec.clone());
    }
    let Some(pos) = spec.args.iter().position(|a| !a.starts_with('-')) else {
        return Err(AgentError::Connection(format!(
            "provider '{}': launch command '{}' is not available",
            spec.id, spec.command
        )));
    };
    let target = strip_version(&spec.args[pos]);
    let Some((_, native)) = NATIVE_EQUIVALENTS.iter().find(|(pkg, _)| *pkg == target) else {
        return Err(AgentError::Connection(format!(
            "provider '{}': launch command '{}' is not available and '{}' has no native equivalent",
            spec.id, spec.command, target
        )));
    };
    if !probe.is_available(native) {
        return Err(AgentError::Connection(format!(
            "provider '{}': neither '{}' nor native equivalent '{}' is available",
            spec.id, spec.command, native
        )));
    }
    tracing::info!(
        provider = %spec.id,
        original = %spec.command,
        native = %native,
        "launch command adapted to native equivalent"
    );
    Ok(LaunchSpec {
        id: spec.id.clone(),
        command: native.to_string(),
        args: spec.args[pos + 1..].to_vec(),
        env: spec.env.clone(),
    })
}

/// 一个活跃连接及其工具目录
pub struct ProviderConnection {
    pub id: String,
    pub launch: LaunchSpec,
    pub tools: Vec<ToolInfo>,
    pub connected_at: DateTime<Utc>,
    provider: Arc<dyn ToolProvider>,
}

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<ProviderConnection>, AgentError>>>;

struct Inner {
    launcher: Arc<dyn ProviderLauncher>,
    probe: Arc<dyn CommandProbe>,
    connections: RwLock<HashMap<String, Arc<ProviderConnection>>>,
    in_flight: Mutex<HashMap<String, ConnectFuture>>,
}

impl Inner {
    async fn establish(self: Arc<Self>, spec: LaunchSpec) -> Result<Arc<ProviderConnection>, AgentError> {
        let result = self.try_establish(&spec).await;
        match &result {
            Ok(conn) => {
                self.connections
                    .write()
                    .await
                    .insert(spec.id.clone(), conn.clone());
                tracing::info!(provider = %spec.id, tools = conn.tools.len(), "tool provider connected");
            }
            Err(e) => {
                tracing::warn!(provider = %spec.id, error = %e, "tool provider connection failed");
            }
        }
        self.in_flight.lock().await.remove(&spec.id);
        result
    }

    async fn try_establish(&self, spec: &LaunchSpec) -> Result<Arc<ProviderConnection>, AgentError> {
        let launch = resolve_launch(spec, self.probe.as_ref())?;
        let provider = self.launcher.launch(&launch).await?;
        let tools = match provider.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                let _ = provider.shutdown().await;
                return Err(e);
            }
        };
        Ok(Arc::new(ProviderConnection {
            id: spec.id.clone(),
            launch,
            tools,
            connected_at: Utc::now(),
            provider,
        }))
    }
}

/// 工具提供方连接管理器（可廉价克隆，内部共享）
#[derive(Clone)]
pub struct ToolConnectionManager {
    inner: Arc<Inner>,
}

impl ToolConnectionManager {
    pub fn new(launcher: Arc<dyn ProviderLauncher>) -> Self {
        Self::with_probe(launcher, Arc::new(PathProbe))
    }

    pub fn with_probe(launcher: Arc<dyn ProviderLauncher>, probe: Arc<dyn CommandProbe>) -> Self {
        Self {
            inner: Arc::new(Inner {
                launcher,
                probe,
                connections: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 连接提供方；已连接直接返回缓存，正在连接则等待同一次尝试
    pub async fn connect_server(&self, entry: &ProviderEntry) -> Result<Arc<ProviderConnection>, AgentError> {
        if let Some(conn) = self.inner.connections.read().await.get(&entry.id) {
            return Ok(conn.clone());
        }
        let attempt = {
            let mut in_flight = self.inner.in_flight.lock().await;
            // 持有 in_flight 锁后再查一次，避免刚完成的连接被重复建立
            if let Some(conn) = self.inner.connections.read().await.get(&entry.id) {
                return Ok(conn.clone());
            }
            match in_flight.get(&entry.id) {
                Some(existing) => existing.clone(),
                None => {
                    let spec = LaunchSpec::from(entry);
                    let attempt = self.inner.clone().establish(spec).boxed().shared();
                    in_flight.insert(entry.id.clone(), attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// 并发连接全部提供方；单个失败只记录日志
    pub async fn connect_all(&self, entries: &[ProviderEntry]) -> Vec<(String, Result<(), AgentError>)> {
        let attempts = entries.iter().map(|e| async move {
            (e.id.clone(), self.connect_server(e).await.map(|_| ()))
        });
        futures_util::future::join_all(attempts).await
    }

    pub async fn is_connected(&self, id: &str) -> bool {
        self.inner.connections.read().await.contains_key(id)
    }

    /// 调用指定连接上的工具；未连接返回 NotConnected
    pub async fn execute_tool(
        &self,
        id: &str,
        tool_name: &str,
        args: serde_json::Value,
    ) -> Result<String, AgentError> {
        let conn = self
            .inner
            .connections
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::NotConnected(id.to_string()))?;
        conn.provider.call_tool(tool_name, args).await
    }

    /// 按工具名查找提供它的连接 id
    pub async fn find_tool(&self, tool_name: &str) -> Option<String> {
        let connections = self.inner.connections.read().await;
        let mut ids: Vec<&String> = connections
            .iter()
            .filter(|(_, c)| c.tools.iter().any(|t| t.name == tool_name))
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids.first().map(|id| id.to_string())
    }

    /// 所有已连接提供方的工具目录
    pub async fn catalog(&self) -> Vec<ToolInfo> {
        let connections = self.inner.connections.read().await;
        let mut ids: Vec<&String> = connections.keys().collect();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| connections.get(id))
            .flat_map(|c| c.tools.iter().cloned())
            .collect()
    }

    pub async fn disconnect(&self, id: &str) -> Result<bool, AgentError> {
        let removed = self.inner.connections.write().await.remove(id);
        match removed {
            Some(conn) => {
                conn.provider.shutdown().await?;
                tracing::info!(provider = %id, "tool provider disconnected");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn disconnect_all(&self) {
        let drained: Vec<(String, Arc<ProviderConnection>)> =
            self.inner.connections.write().await.drain().collect();
        for (id, conn) in drained {
            if let Err(e) = conn.provider.shutdown().await {
                tracing::warn!(provider = %id, error = %e, "tool provider shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct EchoProvider {
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolProvider for EchoProvider {
        async fn list_tools(&self) -> Result<Vec<ToolInfo>, AgentError> {
            Ok(vec![ToolInfo::new("list_pods", "List pods", serde_json::json!({}))])
        }

        async fn call_tool(&self, name: &str, args: serde_json::Value) -> Result<String, AgentError> {
            Ok(format!("{name} {args}"))
        }

        async fn shutdown(&self) -> Result<(), AgentError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct SlowLauncher {
        launches: AtomicUsize,
        shutdowns: Arc<AtomicUsize>,
        last_command: std::sync::Mutex<Option<String>>,
    }

    #[async_trait]
    impl ProviderLauncher for SlowLauncher {
        async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn ToolProvider>, AgentError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            *self.last_command.lock().unwrap() = Some(spec.command.clone());
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Arc::new(EchoProvider {
                shutdowns: self.shutdowns.clone(),
            }))
        }
    }

    struct FixedProbe(Vec<&'static str>);

    impl CommandProbe for FixedProbe {
        fn is_available(&self, command: &str) -> bool {
            self.0.iter().any(|c| *c == command)
        }
    }

    fn entry(id: &str, command: &str, args: &[&str]) -> ProviderEntry {
        ProviderEntry {
            id: id.to_string(),
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_connect_launches_once() {
        let launcher = Arc::new(SlowLauncher::default());
        let manager = ToolConnectionManager::with_probe(launcher.clone(), Arc::new(FixedProbe(vec!["k8s"])));
        let e = entry("k8s", "k8s", &[]);

        let (a, b) = tokio::join!(manager.connect_server(&e), manager.connect_server(&e));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));

        // 已连接后再次调用直接命中缓存
        manager.connect_server(&e).await.unwrap();
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_requires_connection() {
        let launcher = Arc::new(SlowLauncher::default());
        let manager = ToolConnectionManager::with_probe(launcher, Arc::new(FixedProbe(vec!["k8s"])));
        let err = manager
            .execute_tool("k8s", "list_pods", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::NotConnected("k8s".to_string()));

        manager.connect_server(&entry("k8s", "k8s", &[])).await.unwrap();
        let out = manager
            .execute_tool("k8s", "list_pods", serde_json::json!({"ns": "default"}))
            .await
            .unwrap();
        assert!(out.starts_with("list_pods"));
        assert_eq!(manager.find_tool("list_pods").await.as_deref(), Some("k8s"));
    }

    #[tokio::test]
    async fn test_adapts_to_native_equivalent() {
        let launcher = Arc::new(SlowLauncher::default());
        let manager = ToolConnectionManager::with_probe(
            launcher.clone(),
            Arc::new(FixedProbe(vec!["aws-api-mcp-server"])),
        );
        let conn = manager
            .connect_server(&entry("aws", "uvx", &["awslabs.aws-api-mcp-server@latest", "--region", "us-east-1"]))
            .await
            .unwrap();
        assert_eq!(conn.launch.command, "aws-api-mcp-server");
        assert_eq!(conn.launch.args, vec!["--region".to_string(), "us-east-1".to_string()]);
        assert_eq!(launcher.last_command.lock().unwrap().as_deref(), Some("aws-api-mcp-server"));
    }

    #[tokio::test]
    async fn test_missing_command_without_equivalent_fails_fast() {
        let launcher = Arc::new(SlowLauncher::default());
        let manager = ToolConnectionManager::with_probe(launcher.clone(), Arc::new(FixedProbe(vec![])));
        let err = manager
            .connect_server(&entry("x", "npx", &["-y", "some-unknown-server"]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::Connection(_)));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
        assert!(!manager.is_connected("x").await);
    }

    #[tokio::test]
    async fn test_disconnect_clears_cache() {
        let launcher = Arc::new(SlowLauncher::default());
        let manager = ToolConnectionManager::with_probe(launcher.clone(), Arc::new(FixedProbe(vec!["a", "b"])));
        manager.connect_server(&entry("a", "a", &[])).await.unwrap();
        manager.connect_server(&entry("b", "b", &[])).await.unwrap();
        assert!(manager.disconnect("a").await.unwrap());
        assert!(!manager.disconnect("a").await.unwrap());
        manager.disconnect_all().await;
        assert!(manager.catalog().await.is_empty());
        assert_eq!(launcher.shutdowns.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_strip_version() {
        assert_eq!(strip_version("pkg@1.2.3"), "pkg");
        assert_eq!(strip_version("@scope/pkg@latest"), "@scope/pkg");
        assert_eq!(strip_version("@scope/pkg"), "@scope/pkg");
    }
}
