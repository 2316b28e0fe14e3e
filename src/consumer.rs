//! 客户端流消费者：解析事件流，围绕提问做 暂停/恢复 状态机
//!
//! 单线程事件驱动。挂起点只有两个：等下一个传输分片，等用户输入。
//! 答案提交与分片接收并发进行——用户再慢也只挡住「派发」，不挡「摄入」。
//!
//! - Flowing：事件到达即按序派发
//! - QuestionAsk：转入 Paused，渲染提示；其后到达的事件一律进 FIFO 队列
//! - 答案被服务端确认后：按原顺序重放队列，再回到 Flowing
//!   （防乱序保证：队列事件先于任何更新的事件被处理）
//! - 提交走有界重试 + 指数退避；只有服务端确认的成功才推进状态，
//!   裸网络失败不推进——resolve 幂等，重试安全
//! - 滑动静默超时：每收到一个字节重置；触发即判定连接死亡并强制关闭
//!   （中间设备可能无信号地掐掉空闲长连接）

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant, Sleep};

use crate::config::ClientSection;
use crate::error::StreamError;
use crate::event::{EventPayload, OutputEvent};
use crate::question::QuestionKind;

/// 消费者状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Flowing,
    Paused,
}

/// 待回答的问题（渲染提示用）
#[derive(Debug, Clone)]
pub struct QuestionPrompt {
    pub question_id: String,
    pub kind: QuestionKind,
    pub message: String,
    pub choices: Option<Vec<String>>,
}

/// 用户输入采集（TUI / Web 前端各自实现）
#[async_trait]
pub trait AnswerPrompter: Send + Sync {
    async fn prompt(&self, question: &QuestionPrompt) -> String;
}

/// 单次提交的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    /// 服务端确认首次结算
    Accepted,
    /// 分支已关闭（已回答 / 已超时 / 未知）：停止重试
    Closed,
}

/// 答案提交（单次尝试）；瞬态失败以 Err(Transport) 返回，由消费者重试
#[async_trait]
pub trait AnswerSubmitter: Send + Sync {
    async fn submit(&self, question_id: &str, answer: &str) -> Result<SubmitResult, StreamError>;
}

/// HTTP 答案提交：POST /api/questions/{id}/answer
///
/// 状态语义：2xx 按 body.success 区分；4xx 视为分支关闭（停止重试）；
/// 5xx 与网络错误视为瞬态（可重试）。
pub struct HttpAnswerSubmitter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAnswerSubmitter {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AnswerSubmitter for HttpAnswerSubmitter {
    async fn submit(&self, question_id: &str, answer: &str) -> Result<SubmitResult, StreamError> {
        let url = format!("{}/api/questions/{}/answer", self.base_url, question_id);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "answer": answer }))
            .send()
            .await
            .map_err(|e| StreamError::Transport(format!("answer submit failed: {}", e)))?;

        let status = resp.status();
        if status.is_success() {
            let body: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| StreamError::Transport(format!("bad answer response: {}", e)))?;
            if body.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
                Ok(SubmitResult::Accepted)
            } else {
                Ok(SubmitResult::Closed)
            }
        } else if status.is_client_error() {
            Ok(SubmitResult::Closed)
        } else {
            Err(StreamError::Transport(format!(
                "answer endpoint returned {}",
                status
            )))
        }
    }
}

/// 订阅任务事件流，返回原始字节流（交给 [`ClientStreamConsumer::run`]）
pub async fn open_event_stream(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &str,
) -> Result<impl Stream<Item = Result<Bytes, reqwest::Error>>, StreamError> {
    let url = format!(
        "{}/api/jobs/{}/events",
        base_url.trim_end_matches('/'),
        job_id
    );
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| StreamError::Transport(format!("subscribe failed: {}", e)))?
        .error_for_status()
        .map_err(|e| StreamError::Transport(format!("subscribe rejected: {}", e)))?;
    Ok(resp.bytes_stream())
}

/// 消费者配置
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub inactivity_timeout: Duration,
}

impl From<&ClientSection> for ConsumerConfig {
    fn from(section: &ClientSection) -> Self {
        Self {
            max_retries: section.answer_max_retries,
            base_delay: Duration::from_millis(section.answer_base_delay_ms),
            inactivity_timeout: Duration::from_secs(section.inactivity_timeout_secs),
        }
    }
}

/// 滑动静默看门狗：包装字节流，每个分片到达即重置计时器
///
/// 计时器先于下一个分片到期时，以 Transport 错误终结流。
struct InactivityWatchdog<S> {
    inner: S,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    fired: bool,
}

impl<S> InactivityWatchdog<S> {
    fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(sleep(timeout)),
            fired: false,
        }
    }
}

impl<S, E> Stream for InactivityWatchdog<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = Result<Bytes, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.fired {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let timeout = this.timeout;
                this.deadline.as_mut().reset(Instant::now() + timeout);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(StreamError::Transport(
                format!("stream error: {}", e),
            )))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => {
                if this.deadline.as_mut().poll(cx).is_ready() {
                    this.fired = true;
                    return Poll::Ready(Some(Err(StreamError::Transport(
                        "connection went silent (inactivity timeout)".to_string(),
                    ))));
                }
                Poll::Pending
            }
        }
    }
}

/// 答案流程的结算（提交任务 -> 主循环）
enum AnswerFlow {
    /// 服务端确认成功
    Accepted,
    /// 分支已关闭（照样恢复派发，不算终态错误）
    Closed,
    /// 重试耗尽
    Exhausted(StreamError),
}

/// 客户端流消费者（每客户端会话一个实例，按任务重置）
pub struct ClientStreamConsumer {
    dispatch_tx: mpsc::UnboundedSender<OutputEvent>,
    prompter: Arc<dyn AnswerPrompter>,
    submitter: Arc<dyn AnswerSubmitter>,
    config: ConsumerConfig,
    state: ConsumerState,
    queue: VecDeque<OutputEvent>,
    current_question: Option<QuestionPrompt>,
    ended: bool,
}

impl ClientStreamConsumer {
    pub fn new(
        dispatch_tx: mpsc::UnboundedSender<OutputEvent>,
        prompter: Arc<dyn AnswerPrompter>,
        submitter: Arc<dyn AnswerSubmitter>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            dispatch_tx,
            prompter,
            submitter,
            config,
            state: ConsumerState::Flowing,
            queue: VecDeque::new(),
            current_question: None,
            ended: false,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// 消费一条原始字节流直至 stream_end / 终态错误
    pub async fn run<S, E>(&mut self, byte_stream: S) -> Result<(), StreamError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        let watchdog = InactivityWatchdog::new(byte_stream, self.config.inactivity_timeout);
        let mut events = watchdog.eventsource();
        let (answer_tx, mut answer_rx) = mpsc::unbounded_channel::<AnswerFlow>();

        loop {
            tokio::select! {
                item = events.next() => {
                    match item {
                        Some(Ok(frame)) => {
                            if frame.data.is_empty() {
                                continue;
                            }
                            let event: OutputEvent = serde_json::from_str(&frame.data)
                                .map_err(|e| StreamError::Serialize(format!("bad event frame: {}", e)))?;
                            self.handle_event(event, &answer_tx);
                            if self.ended {
                                return Ok(());
                            }
                        }
                        Some(Err(eventsource_stream::EventStreamError::Transport(e))) => {
                            return Err(e);
                        }
                        Some(Err(e)) => {
                            return Err(StreamError::Transport(format!("SSE parse error: {}", e)));
                        }
                        None => {
                            // 未见 stream_end 即断流：意外关闭
                            return Err(StreamError::Transport(
                                "stream closed before stream_end".to_string(),
                            ));
                        }
                    }
                }
                Some(flow) = answer_rx.recv() => {
                    match flow {
                        AnswerFlow::Accepted => {
                            self.resume(&answer_tx);
                        }
                        AnswerFlow::Closed => {
                            // 问题已在服务端走了别的出口（超时/取消），恢复派发即可
                            tracing::warn!("Question branch closed on server side");
                            self.resume(&answer_tx);
                        }
                        AnswerFlow::Exhausted(e) => {
                            return Err(e);
                        }
                    }
                    if self.ended {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// 到达事件入口：Paused 一律排队，Flowing 即时派发
    fn handle_event(&mut self, event: OutputEvent, answer_tx: &mpsc::UnboundedSender<AnswerFlow>) {
        match self.state {
            ConsumerState::Paused => self.queue.push_back(event),
            ConsumerState::Flowing => self.dispatch(event, answer_tx),
        }
    }

    fn dispatch(&mut self, event: OutputEvent, answer_tx: &mpsc::UnboundedSender<AnswerFlow>) {
        if let EventPayload::QuestionAsk {
            question_id,
            question_type,
            message,
            choices,
        } = &event.payload
        {
            let question = QuestionPrompt {
                question_id: question_id.clone(),
                kind: *question_type,
                message: message.clone(),
                choices: choices.clone(),
            };
            self.state = ConsumerState::Paused;
            self.current_question = Some(question.clone());
            let _ = self.dispatch_tx.send(event);
            self.spawn_answer_flow(question, answer_tx.clone());
            return;
        }
        if matches!(event.payload, EventPayload::StreamEnd) {
            self.ended = true;
        }
        let _ = self.dispatch_tx.send(event);
    }

    /// 恢复：按原顺序重放队列；队列里再冒出提问则中途重新暂停
    fn resume(&mut self, answer_tx: &mpsc::UnboundedSender<AnswerFlow>) {
        self.state = ConsumerState::Flowing;
        self.current_question = None;
        while let Some(event) = self.queue.pop_front() {
            self.dispatch(event, answer_tx);
            if self.state == ConsumerState::Paused {
                break;
            }
        }
    }

    /// 采集输入并提交答案（独立任务，和摄入并发）
    fn spawn_answer_flow(
        &self,
        question: QuestionPrompt,
        answer_tx: mpsc::UnboundedSender<AnswerFlow>,
    ) {
        let prompter = Arc::clone(&self.prompter);
        let submitter = Arc::clone(&self.submitter);
        let max_retries = self.config.max_retries.max(1);
        let base_delay = self.config.base_delay;
        tokio::spawn(async move {
            let answer = prompter.prompt(&question).await;
            let mut delay = base_delay;
            for attempt in 1..=max_retries {
                match submitter.submit(&question.question_id, &answer).await {
                    Ok(SubmitResult::Accepted) => {
                        let _ = answer_tx.send(AnswerFlow::Accepted);
                        return;
                    }
                    Ok(SubmitResult::Closed) => {
                        let _ = answer_tx.send(AnswerFlow::Closed);
                        return;
                    }
                    Err(e) => {
                        if attempt == max_retries {
                            let _ = answer_tx.send(AnswerFlow::Exhausted(StreamError::Transport(
                                format!(
                                    "answer submission failed after {} attempts: {}",
                                    attempt, e
                                ),
                            )));
                            return;
                        }
                        tracing::warn!("Answer submit attempt {} failed: {}, retrying", attempt, e);
                        sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        });
    }
}
