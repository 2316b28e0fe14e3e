//! HTTP 服务层：SSE 事件流端点与答案回传端点
//!
//! 线格式：每事件一帧 `data: <json>`（标准 SSE），keep-alive 注释帧
//! 充当 per-sink 心跳。答案端点是 ClientStreamConsumer 的对端契约：
//! 首次结算返回 `{"success":true}`；问题已非 Pending 返回
//! `{"success":false}`；未知问题返回 404。调用方以此区分
//! 「停止重试（分支已关闭）」与「瞬态失败（可重试）」。

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde::{Deserialize, Serialize};

use crate::adapter;
use crate::config::AppConfig;
use crate::question::QuestionRegistry;
use crate::session::{JobStatus, SessionRegistry};

/// 服务端共享状态（按进程显式构造，非全局单例，便于测试从零启动）
pub struct ServerState {
    pub config: AppConfig,
    pub questions: Arc<QuestionRegistry>,
    pub sessions: Arc<SessionRegistry>,
}

/// POST /api/questions/{id}/answer 请求体
#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub answer: String,
}

/// 答案端点响应
#[derive(Debug, Serialize)]
pub struct AnswerResponse {
    pub success: bool,
}

/// 组装路由
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/jobs/:job_id/events", get(api_job_events))
        .route("/api/jobs/:job_id/status", get(api_job_status))
        .route("/api/jobs/:job_id/cancel", post(api_job_cancel))
        .route("/api/questions/:question_id/answer", post(api_answer))
        .with_state(state)
}

/// GET /api/jobs/{id}/events：SSE 流，接入一个 sink
///
/// 只推送接入之后发布的事件（不回放）；历史请走 status 端点。
async fn api_job_events(
    State(state): State<Arc<ServerState>>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)>
{
    let sink = state
        .sessions
        .open_sink(&job_id)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;

    let event_stream = stream::unfold(sink.rx, |mut rx| async move {
        match rx.recv().await {
            Some(ev) => {
                let data = serde_json::to_string(&ev).unwrap_or_default();
                Some((Ok(Event::default().data(data)), rx))
            }
            None => None,
        }
    });

    Ok(Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(state.config.server.keepalive_secs))
            .text("keepalive"),
    ))
}

/// GET /api/jobs/{id}/status：任务状态快照（重连客户端补历史用）
async fn api_job_status(
    State(state): State<Arc<ServerState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatus>, (StatusCode, String)> {
    match state.sessions.job_status(&job_id).await {
        Some(status) => Ok(Json(status)),
        None => Err((StatusCode::NOT_FOUND, format!("Job not found: {}", job_id))),
    }
}

/// POST /api/jobs/{id}/cancel：协作式取消（会话标记 + Pending 问题批量取消）
async fn api_job_cancel(
    State(state): State<Arc<ServerState>>,
    Path(job_id): Path<String>,
) -> Json<AnswerResponse> {
    adapter::cancel_job(&state.sessions, &state.questions, &job_id).await;
    Json(AnswerResponse { success: true })
}

/// POST /api/questions/{id}/answer：答案回传
async fn api_answer(
    State(state): State<Arc<ServerState>>,
    Path(question_id): Path<String>,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<AnswerResponse>, (StatusCode, String)> {
    if state.questions.resolve(&question_id, &req.answer).await {
        return Ok(Json(AnswerResponse { success: true }));
    }
    if state.questions.contains(&question_id).await {
        // 已回答 / 已超时 / 已取消：幂等拒绝，分支已关闭
        return Ok(Json(AnswerResponse { success: false }));
    }
    Err((
        StatusCode::NOT_FOUND,
        format!("Question not found: {}", question_id),
    ))
}

/// 单轮清扫：回收过期任务并连带销毁其问题（含 Pending，先行取消），
/// 再按保留窗口清扫已结算问题。返回（任务数，问题数）。
pub async fn sweep_registries(
    state: &ServerState,
    job_retention: Duration,
    question_retention: Duration,
) -> (usize, usize) {
    let reaped = state.sessions.cleanup_expired(job_retention).await;
    for job_id in &reaped {
        state.questions.remove_job(job_id).await;
    }
    let questions = state.questions.evict_resolved(question_retention).await;
    (reaped.len(), questions)
}

/// 后台维护循环：按保留窗口清扫两张注册表
pub fn spawn_maintenance(state: Arc<ServerState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(state.config.session.cleanup_interval_secs.max(1));
        let job_retention = Duration::from_secs(state.config.session.job_retention_secs);
        let question_retention = Duration::from_secs(state.config.question.retention_secs);
        let mut timer = tokio::time::interval(interval);
        loop {
            timer.tick().await;
            let (jobs, questions) =
                sweep_registries(&state, job_retention, question_retention).await;
            if jobs > 0 || questions > 0 {
                tracing::info!("Cleaned up {} job(s), {} question(s)", jobs, questions);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::question::{QuestionKind, TimeoutPolicy};
    use crate::session::SessionConfig;

    fn state() -> Arc<ServerState> {
        Arc::new(ServerState {
            config: AppConfig::default(),
            questions: Arc::new(QuestionRegistry::new(TimeoutPolicy::FailFast)),
            sessions: Arc::new(SessionRegistry::new(SessionConfig::default())),
        })
    }

    #[tokio::test]
    async fn test_answer_endpoint_contract() {
        let state = state();
        let (question, rx) = state
            .questions
            .create("j1", QuestionKind::Input, "Name?", None, None)
            .await;

        // 首次提交：success:true
        let res = api_answer(
            State(Arc::clone(&state)),
            Path(question.id.clone()),
            Json(AnswerRequest {
                answer: "Alice".to_string(),
            }),
        )
        .await
        .unwrap();
        assert!(res.0.success);
        assert_eq!(
            rx.await.unwrap(),
            crate::question::AnswerOutcome::Answered("Alice".to_string())
        );

        // 重复提交：success:false，首个答案不被覆盖
        let res = api_answer(
            State(Arc::clone(&state)),
            Path(question.id.clone()),
            Json(AnswerRequest {
                answer: "Bob".to_string(),
            }),
        )
        .await
        .unwrap();
        assert!(!res.0.success);

        // 未知问题：404
        let err = api_answer(
            State(state),
            Path("q_unknown".to_string()),
            Json(AnswerRequest {
                answer: "x".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let state = state();
        state.sessions.open_job("j1").await;
        let status = api_job_status(State(Arc::clone(&state)), Path("j1".to_string()))
            .await
            .unwrap();
        assert_eq!(status.0.job_id, "j1");
        assert!(!status.0.finished);

        let err = api_job_status(State(state), Path("j2".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sweep_tears_down_questions_of_reaped_jobs() {
        let state = state();
        state.sessions.open_job("j1").await;
        // 无期限的 Pending 问题，任务随后完成且无 sink
        let (_, rx) = state
            .questions
            .create("j1", QuestionKind::Input, "stuck?", None, None)
            .await;
        state
            .sessions
            .publish("j1", crate::event::EventPayload::StreamEnd)
            .await
            .unwrap();

        let (jobs, _) = sweep_registries(&state, Duration::ZERO, Duration::ZERO).await;
        assert_eq!(jobs, 1);
        // 问题随任务销毁：等待方解除，注册表不残留
        assert_eq!(rx.await.unwrap(), crate::question::AnswerOutcome::Cancelled);
        assert!(state.questions.snapshot("j1").await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_endpoint_unblocks_question() {
        let state = state();
        state.sessions.open_job("j1").await;
        let (_, rx) = state
            .questions
            .create("j1", QuestionKind::Input, "stuck?", None, None)
            .await;

        api_job_cancel(State(Arc::clone(&state)), Path("j1".to_string())).await;
        assert_eq!(rx.await.unwrap(), crate::question::AnswerOutcome::Cancelled);
        assert!(state.sessions.is_cancelled("j1").await);
    }
}
