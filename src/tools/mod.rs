//! 工具层：注册表、执行器、外部提供方连接、内置工具

pub mod connection;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod shell;
pub mod stdio;
pub mod todo;

pub use connection::{
    resolve_launch, CommandProbe, LaunchSpec, PathProbe, ProviderConnection, ProviderLauncher,
    ToolConnectionManager, ToolProvider,
};
pub use executor::{truncate_output, ToolExecutor};
pub use filesystem::{ReadFileTool, SafeFs, WriteFileTool};
pub use registry::{to_function_schema, Tool, ToolInfo, ToolRegistry};
pub use shell::ShellTool;
pub use stdio::{StdioLauncher, StdioProvider};
