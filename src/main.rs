//! Hive 命令行入口
//!
//! run / resume 每行输出一个 JSON 事件，以 done 结束。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hive::config::load_config;
use hive::graph::ApprovalDecision;
use hive::{AgentRuntime, AppContext, RunHandle};

#[derive(Parser)]
#[command(name = "hive", version, about = "Agent graph runner with checkpoints and approvals")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new turn on a thread.
    Run {
        thread: String,
        #[arg(required = true, num_args = 1..)]
        input: Vec<String>,
    },
    /// Resume a thread awaiting approval with decisions from a JSON file.
    Resume {
        thread: String,
        decisions: PathBuf,
    },
    /// List recent threads.
    Threads {
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },
    /// Show checkpoint history of a thread, newest first.
    History {
        thread: String,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();
    let cli = Cli::parse();

    let config = load_config(cli.config).context("failed to load config")?;
    let workspace = std::env::current_dir().context("failed to resolve working directory")?;
    let ctx = AppContext::from_config(config, workspace)
        .await
        .context("failed to build context")?;
    let runtime = AgentRuntime::new(Arc::new(ctx));

    let result = dispatch(&runtime, cli.command).await;
    runtime.context().shutdown().await;
    result
}

async fn dispatch(runtime: &AgentRuntime, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run { thread, input } => {
            let handle = runtime.start(&thread, &input.join(" ")).await?;
            print_events(handle).await
        }
        Command::Resume { thread, decisions } => {
            let raw = std::fs::read_to_string(&decisions)
                .with_context(|| format!("failed to read decisions from {}", decisions.display()))?;
            let decisions: Vec<ApprovalDecision> =
                serde_json::from_str(&raw).context("decisions must be a JSON array")?;
            let handle = runtime.resume(&thread, decisions).await?;
            print_events(handle).await
        }
        Command::Threads { limit } => {
            for t in runtime.threads(limit).await? {
                println!("{}", serde_json::to_string(&t)?);
            }
            Ok(())
        }
        Command::History { thread, limit } => {
            for cp in runtime.history(&thread, limit).await? {
                println!(
                    "{}",
                    serde_json::json!({
                        "stepId": cp.step_id,
                        "status": cp.status,
                        "nextNode": cp.next_node,
                        "createdAt": cp.created_at,
                        "messages": cp.state.messages.len(),
                    })
                );
            }
            Ok(())
        }
    }
}

async fn print_events(mut handle: RunHandle) -> anyhow::Result<()> {
    while let Some(ev) = handle.events.recv().await {
        println!("{}", serde_json::to_string(&ev)?);
    }
    handle
        .completion
        .await
        .context("run task aborted")?
        .context("run failed")?;
    Ok(())
}
