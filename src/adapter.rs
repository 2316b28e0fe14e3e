//! Agent 事件桥：把 Agent 内部生命周期接到分类器与注册表
//!
//! Agent 循环只看到这一层：文本增量、工具信号、完成/错误，以及唯一的
//! 同步点 `ask()`。循环本身不持有任何传输知识；问题经 QuestionChannel
//! 发出，调用方真正挂起（消息传递 + future，而非回调嵌套），直到
//! 回答 / fallback / 取消三者之一解除阻塞。
//!
//! QuestionChannel 有两个可互换实现，构造时显式选定（而非运行时嗅探）：
//! - [`HttpQuestionChannel`]：注册问题 + 发布 question_ask 事件，
//!   答案经 HTTP 答案端点回传（见 server 模块）
//! - [`UiQuestionChannel`]：本地前端直连（mpsc 往返），无 HTTP

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::classifier::{TagClassifier, TagPolicy};
use crate::error::StreamError;
use crate::event::EventPayload;
use crate::question::{AnswerOutcome, QuestionKind, QuestionRegistry, TimeoutPolicy};
use crate::session::SessionRegistry;

/// 提问通道：一个固定接口，两种实现
#[async_trait]
pub trait QuestionChannel: Send + Sync {
    /// 发出问题并挂起，直到答案 / fallback / 取消
    async fn ask(
        &self,
        job_id: &str,
        kind: QuestionKind,
        prompt: &str,
        choices: Option<Vec<String>>,
    ) -> Result<String, StreamError>;
}

/// HTTP 回传的提问通道：QuestionRegistry + SessionRegistry 组合
pub struct HttpQuestionChannel {
    questions: Arc<QuestionRegistry>,
    sessions: Arc<SessionRegistry>,
    /// 问题期限，None 表示无限等待
    timeout: Option<Duration>,
}

impl HttpQuestionChannel {
    pub fn new(
        questions: Arc<QuestionRegistry>,
        sessions: Arc<SessionRegistry>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            questions,
            sessions,
            timeout,
        }
    }
}

#[async_trait]
impl QuestionChannel for HttpQuestionChannel {
    async fn ask(
        &self,
        job_id: &str,
        kind: QuestionKind,
        prompt: &str,
        choices: Option<Vec<String>>,
    ) -> Result<String, StreamError> {
        let (question, rx) = self
            .questions
            .create(job_id, kind, prompt, choices.clone(), self.timeout)
            .await;

        // 注册后复查取消标记：cancel 只能清理已存在的问题，落在
        // 检查与注册之间的 cancel 由这次复查补上，否则无期限的问题
        // 会永远 Pending
        if self.sessions.is_cancelled(job_id).await {
            self.questions.cancel(job_id).await;
            return Err(StreamError::JobCancelled(job_id.to_string()));
        }

        self.sessions
            .publish(
                job_id,
                EventPayload::QuestionAsk {
                    question_id: question.id.clone(),
                    question_type: kind,
                    message: prompt.to_string(),
                    choices,
                },
            )
            .await?;

        // 真正挂起（非轮询）：future 结算即解除
        let outcome = rx
            .await
            .map_err(|_| StreamError::JobCancelled(job_id.to_string()))?;
        match outcome {
            AnswerOutcome::Answered(answer) => Ok(answer),
            AnswerOutcome::Fallback(fallback) => {
                // fallback 透明放行，但要让观察方看得见
                let _ = self
                    .sessions
                    .publish(
                        job_id,
                        EventPayload::Progress {
                            message: format!(
                                "Question {} timed out, fallback answer used",
                                question.id
                            ),
                            content_type: crate::classifier::SegmentKind::System,
                            tool_name: None,
                        },
                    )
                    .await;
                tracing::warn!("Question {} fell back for job {}", question.id, job_id);
                Ok(fallback)
            }
            AnswerOutcome::Expired => {
                let _ = self
                    .sessions
                    .publish(
                        job_id,
                        EventPayload::Error {
                            text: format!("Question {} timed out", question.id),
                        },
                    )
                    .await;
                Err(StreamError::QuestionTimeout(question.id))
            }
            AnswerOutcome::Cancelled => Err(StreamError::JobCancelled(job_id.to_string())),
        }
    }
}

/// 本地前端的提问请求（UI 宿主从通道另一端取走并回填）
pub struct UiPrompt {
    pub job_id: String,
    pub kind: QuestionKind,
    pub prompt: String,
    pub choices: Option<Vec<String>>,
    pub reply: oneshot::Sender<String>,
}

/// 本地前端直连的提问通道（TUI 等宿主场景，无 HTTP）
pub struct UiQuestionChannel {
    prompt_tx: mpsc::UnboundedSender<UiPrompt>,
}

impl UiQuestionChannel {
    /// 返回通道与宿主侧的接收端
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiPrompt>) {
        let (prompt_tx, prompt_rx) = mpsc::unbounded_channel();
        (Self { prompt_tx }, prompt_rx)
    }
}

#[async_trait]
impl QuestionChannel for UiQuestionChannel {
    async fn ask(
        &self,
        job_id: &str,
        kind: QuestionKind,
        prompt: &str,
        choices: Option<Vec<String>>,
    ) -> Result<String, StreamError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.prompt_tx
            .send(UiPrompt {
                job_id: job_id.to_string(),
                kind,
                prompt: prompt.to_string(),
                choices,
                reply: reply_tx,
            })
            .map_err(|_| StreamError::JobCancelled(job_id.to_string()))?;
        reply_rx
            .await
            .map_err(|_| StreamError::JobCancelled(job_id.to_string()))
    }
}

/// Agent 事件桥（每任务一个实例，独占该任务的分类器状态）
pub struct AgentEventAdapter {
    job_id: String,
    classifier: TagClassifier,
    sessions: Arc<SessionRegistry>,
    channel: Arc<dyn QuestionChannel>,
}

impl AgentEventAdapter {
    pub fn new(
        job_id: &str,
        sessions: Arc<SessionRegistry>,
        channel: Arc<dyn QuestionChannel>,
        policy: TagPolicy,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            classifier: TagClassifier::new(policy),
            sessions,
            channel,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// 任务开始：建档并发布 start
    pub async fn start(&self) -> Result<(), StreamError> {
        self.sessions.open_job(&self.job_id).await;
        self.sessions
            .publish(&self.job_id, EventPayload::Start)
            .await?;
        Ok(())
    }

    /// 模型文本增量：喂分类器，按分类器输出顺序发布 progress
    ///
    /// 单任务单生产者，发布顺序天然正确。
    pub async fn on_text(&mut self, fragment: &str) -> Result<(), StreamError> {
        for segment in self.classifier.feed(fragment) {
            self.sessions
                .publish(&self.job_id, EventPayload::progress(segment))
                .await?;
        }
        Ok(())
    }

    /// 工具调用信号
    pub async fn on_tool_use(
        &self,
        tool: &str,
        args: serde_json::Value,
    ) -> Result<(), StreamError> {
        self.sessions
            .publish(
                &self.job_id,
                EventPayload::ToolUse {
                    tool: tool.to_string(),
                    args,
                },
            )
            .await?;
        Ok(())
    }

    /// Token 统计
    pub async fn on_token_usage(
        &self,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Result<(), StreamError> {
        self.sessions
            .publish(
                &self.job_id,
                EventPayload::TokenUsage {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                },
            )
            .await?;
        Ok(())
    }

    /// 阻塞式提问：Agent 顺序循环与异步答案通道之间唯一的同步点
    pub async fn ask(
        &self,
        kind: QuestionKind,
        prompt: &str,
        choices: Option<Vec<String>>,
    ) -> Result<String, StreamError> {
        if self.sessions.is_cancelled(&self.job_id).await {
            return Err(StreamError::JobCancelled(self.job_id.clone()));
        }
        self.channel.ask(&self.job_id, kind, prompt, choices).await
    }

    /// 任务正常完成：冲洗分类器残余，发布 completion + stream_end
    pub async fn complete(&mut self, message: Option<String>) -> Result<(), StreamError> {
        for segment in self.classifier.finish() {
            self.sessions
                .publish(&self.job_id, EventPayload::progress(segment))
                .await?;
        }
        self.sessions
            .publish(&self.job_id, EventPayload::Completion { message })
            .await?;
        self.sessions
            .publish(&self.job_id, EventPayload::StreamEnd)
            .await?;
        Ok(())
    }

    /// 任务以硬错误收场：error 后跟 stream_end（§ 错误传播策略）
    pub async fn fail(&mut self, text: &str) -> Result<(), StreamError> {
        self.sessions
            .publish(
                &self.job_id,
                EventPayload::Error {
                    text: text.to_string(),
                },
            )
            .await?;
        self.sessions
            .publish(&self.job_id, EventPayload::StreamEnd)
            .await?;
        Ok(())
    }
}

/// 协作式取消：置会话取消标记，并批量取消该任务的 Pending 问题，
/// 保证阻塞中的 ask() 一定解除
pub async fn cancel_job(
    sessions: &SessionRegistry,
    questions: &QuestionRegistry,
    job_id: &str,
) {
    sessions.cancel_job(job_id).await;
    questions.cancel(job_id).await;
}

/// 组装一套 HTTP 回传的注册表 + 通道（按配置的超时策略）
pub fn http_channel(
    questions: &Arc<QuestionRegistry>,
    sessions: &Arc<SessionRegistry>,
    timeout: Option<Duration>,
) -> Arc<dyn QuestionChannel> {
    Arc::new(HttpQuestionChannel::new(
        Arc::clone(questions),
        Arc::clone(sessions),
        timeout,
    ))
}

/// 供调用方按配置字符串构造策略
pub fn timeout_policy(policy: &str, fallback: &str) -> TimeoutPolicy {
    match policy {
        "use_fallback" => TimeoutPolicy::UseFallback(fallback.to_string()),
        _ => TimeoutPolicy::FailFast,
    }
}
