//! 工具注册表
//!
//! 本地工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找；
//! 外部提供方在连接时发现的工具同样以 ToolInfo 描述。ToolInfo 转为模型 function calling 格式只经过 `to_function_schema`。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;

/// 工具描述：名称、说明、参数 JSON Schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub json_schema: Value,
}

impl ToolInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>, json_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            json_schema,
        }
    }
}

/// ToolInfo → OpenAI 兼容的 function 工具定义
pub fn to_function_schema(info: &ToolInfo) -> Value {
    let mut parameters = info.json_schema.clone();
    if let Value::Object(map) = &mut parameters {
        // schemars 生成的元数据字段模型端不需要
        map.remove("$schema");
        map.remove("title");
        map.entry("type").or_insert_with(|| Value::String("object".to_string()));
    } else {
        parameters = serde_json::json!({"type": "object", "properties": {}});
    }
    serde_json::json!({
        "type": "function",
        "function": {
            "name": info.name,
            "description": info.description,
            "parameters": parameters,
        }
    })
}

/// 工具 trait：名称、描述（供模型理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, AgentError>;

    fn info(&self) -> ToolInfo {
        ToolInfo::new(self.name(), self.description(), self.parameters_schema())
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>（有序，保证发给模型的工具列表稳定）
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn infos(&self) -> Vec<ToolInfo> {
        self.tools.values().map(|t| t.info()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Uptime;

    #[async_trait]
    impl Tool for Uptime {
        fn name(&self) -> &str {
            "uptime"
        }

        fn description(&self) -> &str {
            "Report host uptime"
        }

        async fn execute(&self, _args: Value) -> Result<String, AgentError> {
            Ok("up 3 days".to_string())
        }
    }

    #[test]
    fn test_function_schema_shape() {
        let info = ToolInfo::new(
            "read_file",
            "Read a file",
            serde_json::json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "title": "ReadFileArgs",
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        );
        let schema = to_function_schema(&info);
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "read_file");
        assert!(schema["function"]["parameters"].get("$schema").is_none());
        assert_eq!(schema["function"]["parameters"]["required"][0], "path");
    }

    #[test]
    fn test_non_object_schema_is_replaced() {
        let schema = to_function_schema(&ToolInfo::new("x", "y", Value::Null));
        assert_eq!(schema["function"]["parameters"]["type"], "object");
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(Uptime);
        assert!(registry.contains("uptime"));
        let tool = registry.get("uptime").unwrap();
        assert_eq!(tool.execute(Value::Null).await.unwrap(), "up 3 days");
        assert_eq!(registry.infos()[0].name, "uptime");
    }
}
