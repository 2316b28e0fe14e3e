//! Waggle 服务端
//!
//! 启动: cargo run --bin waggle-server
//! 任务提交边界由上层协作方负责：它拿到 jobId 后通过 AgentEventAdapter
//! 驱动事件发布，客户端订阅 GET /api/jobs/{id}/events。

use std::sync::Arc;

use waggle::adapter;
use waggle::config::load_config;
use waggle::question::QuestionRegistry;
use waggle::server::{router, spawn_maintenance, ServerState};
use waggle::session::{SessionConfig, SessionRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    waggle::observability::init();

    let config = load_config(None)?;

    let questions = Arc::new(QuestionRegistry::new(adapter::timeout_policy(
        &config.question.timeout_policy,
        &config.question.fallback_answer,
    )));
    let sessions = Arc::new(SessionRegistry::new(SessionConfig {
        sink_buffer: config.session.sink_buffer,
        max_consecutive_drops: config.session.max_consecutive_drops,
    }));

    let state = Arc::new(ServerState {
        config: config.clone(),
        questions,
        sessions,
    });
    spawn_maintenance(Arc::clone(&state));

    let addr = config.server.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Waggle listening on http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
