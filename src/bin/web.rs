//! Hive HTTP / SSE 接口
//!
//! 启动: cargo run --bin hive-web --features web
//! - POST /api/threads/:id/run      {"input": "..."}        → SSE 事件流
//! - POST /api/threads/:id/resume   {"decisions": [...]}    → SSE 事件流
//! - GET  /api/threads
//! - GET  /api/threads/:id
//! - GET  /api/threads/:id/checkpoints
//!
//! 客户端断开只停止事件投递，运行本身继续完成并落盘。

#![cfg(feature = "web")]

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};

use hive::config::load_config;
use hive::core::ErrorClass;
use hive::graph::ApprovalDecision;
use hive::{AgentError, AgentRuntime, AppContext, RunHandle};

type ApiError = (StatusCode, String);

#[derive(Deserialize)]
struct RunRequest {
    input: String,
}

#[derive(Deserialize)]
struct ResumeRequest {
    decisions: Vec<ApprovalDecision>,
}

fn api_error(e: AgentError) -> ApiError {
    let status = match e.class() {
        ErrorClass::Validation => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// 运行句柄 → SSE；`event:` 为事件类型，`data:` 为 JSON
fn sse(handle: RunHandle) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = stream::unfold(handle.events, |mut rx| async move {
        let ev = rx.recv().await?;
        let sse = Event::default().event(ev.name()).data(ev.data().to_string());
        Some((Ok(sse), rx))
    });
    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}

async fn api_run(
    State(runtime): State<AgentRuntime>,
    Path(thread_id): Path<String>,
    Json(req): Json<RunRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let handle = runtime.start(&thread_id, &req.input).await.map_err(api_error)?;
    Ok(sse(handle))
}

async fn api_resume(
    State(runtime): State<AgentRuntime>,
    Path(thread_id): Path<String>,
    Json(req): Json<ResumeRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let handle = runtime
        .resume(&thread_id, req.decisions)
        .await
        .map_err(api_error)?;
    Ok(sse(handle))
}

async fn api_threads(State(runtime): State<AgentRuntime>) -> Result<Json<Value>, ApiError> {
    let threads = runtime.threads(100).await.map_err(api_error)?;
    Ok(Json(json!({ "threads": threads })))
}

async fn api_thread(
    State(runtime): State<AgentRuntime>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match runtime.thread(&thread_id).await.map_err(api_error)? {
        Some(thread) => Ok(Json(json!(thread))),
        None => Err((StatusCode::NOT_FOUND, format!("thread '{thread_id}' not found"))),
    }
}

async fn api_checkpoints(
    State(runtime): State<AgentRuntime>,
    Path(thread_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let history = runtime.history(&thread_id, 50).await.map_err(api_error)?;
    let items: Vec<Value> = history
        .into_iter()
        .map(|cp| {
            json!({
                "stepId": cp.step_id,
                "status": cp.status,
                "nextNode": cp.next_node,
                "createdAt": cp.created_at,
                "pendingApproval": cp.pending_approval,
            })
        })
        .collect();
    Ok(Json(json!({ "checkpoints": items })))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cfg = load_config(None).context("failed to load config")?;
    let port = std::env::var("HIVE_WEB_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(cfg.web.port);
    let workspace = std::env::current_dir().context("failed to resolve working directory")?;
    let ctx = Arc::new(
        AppContext::from_config(cfg, workspace)
            .await
            .context("failed to build context")?,
    );
    let runtime = AgentRuntime::new(ctx.clone());

    let app = Router::new()
        .route("/api/health", get(|| async { "OK" }))
        .route("/api/threads", get(api_threads))
        .route("/api/threads/:id", get(api_thread))
        .route("/api/threads/:id/checkpoints", get(api_checkpoints))
        .route("/api/threads/:id/run", post(api_run))
        .route("/api/threads/:id/resume", post(api_resume))
        .with_state(runtime);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Hive API: http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    ctx.shutdown().await;
    Ok(())
}
