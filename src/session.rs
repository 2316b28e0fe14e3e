//! 会话注册表：任务 -> 在线投递通道（sink）的映射与事件扇出
//!
//! - 每个任务持有单调递增的 seq 计数器与若干 sink（有界通道）
//! - publish 永不阻塞发布方：sink 缓冲打满时仅对该 sink 丢弃事件，
//!   连续丢弃超过阈值则断开该慢消费者，任务执行不受影响
//! - 新接入的 sink 只看到接入之后发布的事件（显式的不回放策略，
//!   重连客户端应另行查询任务状态补齐历史）
//! - 心跳由传输层的 SSE keep-alive 注释帧承担（见 server 模块），
//!   防止中间设备掐断空闲长连接
//! - 失去最后一个 sink 不取消任务；只有显式 cancel 才取消（协作式，
//!   通过 CancellationToken 在循环边界检查）

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::event::{EventPayload, OutputEvent};

/// 单个投递通道
struct Sink {
    tx: mpsc::Sender<OutputEvent>,
    consecutive_drops: u32,
}

/// 单个任务的投递状态
struct Job {
    /// 下一个待分配的序号
    seq: u64,
    sinks: HashMap<String, Sink>,
    cancel_token: CancellationToken,
    /// completion / abort / stream_end 已发布
    finished: bool,
    /// 进入可回收状态的时刻（完成且最后一个 sink 已离线）
    idle_since: Option<Instant>,
}

impl Job {
    fn new() -> Self {
        Self {
            seq: 0,
            sinks: HashMap::new(),
            cancel_token: CancellationToken::new(),
            finished: false,
            idle_since: Some(Instant::now()),
        }
    }

    fn touch_idle(&mut self) {
        if self.sinks.is_empty() {
            self.idle_since = Some(Instant::now());
        } else {
            self.idle_since = None;
        }
    }
}

/// 接入成功后交给消费方的句柄
pub struct SinkHandle {
    pub sink_id: String,
    pub rx: mpsc::Receiver<OutputEvent>,
}

/// 会话注册表配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 每个 sink 的出站缓冲大小
    pub sink_buffer: usize,
    /// 连续丢弃多少条后断开慢消费者
    pub max_consecutive_drops: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sink_buffer: 256,
            max_consecutive_drops: 8,
        }
    }
}

/// 会话注册表
pub struct SessionRegistry {
    jobs: RwLock<HashMap<String, Job>>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// 任务开始时建档（幂等）
    pub async fn open_job(&self, job_id: &str) {
        let mut jobs = self.jobs.write().await;
        jobs.entry(job_id.to_string()).or_insert_with(Job::new);
    }

    /// 接入一个投递通道；只会看到接入之后发布的事件
    pub async fn open_sink(&self, job_id: &str) -> Result<SinkHandle, StreamError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StreamError::JobNotFound(job_id.to_string()))?;
        let sink_id = format!("sink_{}", uuid::Uuid::new_v4());
        let (tx, rx) = mpsc::channel(self.config.sink_buffer);
        job.sinks.insert(
            sink_id.clone(),
            Sink {
                tx,
                consecutive_drops: 0,
            },
        );
        job.touch_idle();
        tracing::debug!("Sink {} attached to job {}", sink_id, job_id);
        Ok(SinkHandle { sink_id, rx })
    }

    /// 发布一条事件：分配 seq 与时间戳，向所有 sink 扇出
    ///
    /// 永不阻塞调用方。返回分配的 seq。
    pub async fn publish(&self, job_id: &str, payload: EventPayload) -> Result<u64, StreamError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StreamError::JobNotFound(job_id.to_string()))?;

        let seq = job.seq;
        job.seq += 1;
        if matches!(payload, EventPayload::StreamEnd) {
            job.finished = true;
        }
        let event = OutputEvent {
            job_id: job_id.to_string(),
            seq,
            timestamp: chrono::Utc::now().timestamp_millis(),
            payload,
        };

        let max_drops = self.config.max_consecutive_drops;
        let mut disconnected: Vec<String> = Vec::new();
        for (sink_id, sink) in job.sinks.iter_mut() {
            match sink.tx.try_send(event.clone()) {
                Ok(()) => {
                    sink.consecutive_drops = 0;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // 仅对该 sink 丢弃；seq 出现空洞但顺序不乱
                    sink.consecutive_drops += 1;
                    if sink.consecutive_drops >= max_drops {
                        disconnected.push(sink_id.clone());
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    disconnected.push(sink_id.clone());
                }
            }
        }
        for sink_id in disconnected {
            job.sinks.remove(&sink_id);
            tracing::warn!("Sink {} disconnected from job {} (slow or closed)", sink_id, job_id);
        }
        if job.finished {
            job.touch_idle();
        } else if job.sinks.is_empty() {
            job.touch_idle();
        }
        Ok(seq)
    }

    /// 显式拆除一个 sink
    pub async fn close_sink(&self, job_id: &str, sink_id: &str) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.sinks.remove(sink_id);
            job.touch_idle();
        }
    }

    /// 协作式取消：置取消标记；阻塞中的 ask() 由 adapter 的问题批量取消解除
    pub async fn cancel_job(&self, job_id: &str) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.cancel_token.cancel();
            job.finished = true;
            job.touch_idle();
            tracing::info!("Job {} cancelled", job_id);
        }
    }

    /// 任务是否已被取消
    pub async fn is_cancelled(&self, job_id: &str) -> bool {
        let jobs = self.jobs.read().await;
        jobs.get(job_id)
            .map(|j| j.cancel_token.is_cancelled())
            .unwrap_or(true)
    }

    /// 取任务的取消令牌（agent 宿主在循环边界 select 用）
    pub async fn cancel_token(&self, job_id: &str) -> Option<CancellationToken> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).map(|j| j.cancel_token.clone())
    }

    /// 显式销毁任务
    pub async fn close_job(&self, job_id: &str) {
        let mut jobs = self.jobs.write().await;
        if jobs.remove(job_id).is_some() {
            tracing::debug!("Job {} closed", job_id);
        }
    }

    /// 任务状态快照（重连客户端补历史用）
    pub async fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).map(|job| JobStatus {
            job_id: job_id.to_string(),
            next_seq: job.seq,
            sink_count: job.sinks.len(),
            finished: job.finished,
            cancelled: job.cancel_token.is_cancelled(),
        })
    }

    /// 清扫：移除「已完成且最后一个 sink 离线超过保留窗口」的任务，
    /// 返回被回收的任务 ID（调用方据此连带销毁其问题）
    pub async fn cleanup_expired(&self, retention: Duration) -> Vec<String> {
        let mut jobs = self.jobs.write().await;
        let mut reaped = Vec::new();
        jobs.retain(|job_id, job| {
            if !job.finished || !job.sinks.is_empty() {
                return true;
            }
            let keep = match job.idle_since {
                Some(at) => at.elapsed() < retention,
                None => true,
            };
            if !keep {
                reaped.push(job_id.clone());
            }
            keep
        });
        reaped
    }
}

/// 任务状态快照
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobStatus {
    #[serde(rename = "jobId")]
    pub job_id: String,
    #[serde(rename = "nextSeq")]
    pub next_seq: u64,
    #[serde(rename = "sinkCount")]
    pub sink_count: usize,
    pub finished: bool,
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(text: &str) -> EventPayload {
        EventPayload::Progress {
            message: text.to_string(),
            content_type: crate::classifier::SegmentKind::Content,
            tool_name: None,
        }
    }

    #[tokio::test]
    async fn test_sink_observes_strictly_increasing_seq() {
        let registry = SessionRegistry::new(SessionConfig::default());
        registry.open_job("j1").await;
        let mut sink = registry.open_sink("j1").await.unwrap();

        registry.publish("j1", EventPayload::Start).await.unwrap();
        for i in 0..5 {
            registry.publish("j1", progress(&format!("{}", i))).await.unwrap();
        }
        registry.publish("j1", EventPayload::StreamEnd).await.unwrap();

        let mut last = None;
        for _ in 0..7 {
            let ev = sink.rx.recv().await.unwrap();
            if let Some(prev) = last {
                assert_eq!(ev.seq, prev + 1, "no gaps for an unthrottled sink");
            }
            last = Some(ev.seq);
        }
        assert_eq!(last, Some(6));
    }

    #[tokio::test]
    async fn test_late_sink_sees_no_backlog() {
        let registry = SessionRegistry::new(SessionConfig::default());
        registry.open_job("j1").await;
        registry.publish("j1", EventPayload::Start).await.unwrap();
        registry.publish("j1", progress("early")).await.unwrap();

        let mut sink = registry.open_sink("j1").await.unwrap();
        registry.publish("j1", progress("late")).await.unwrap();

        let ev = sink.rx.recv().await.unwrap();
        assert_eq!(ev.seq, 2);
        assert!(matches!(ev.payload, EventPayload::Progress { ref message, .. } if message == "late"));
    }

    #[tokio::test]
    async fn test_slow_sink_dropped_without_blocking_publisher() {
        let registry = SessionRegistry::new(SessionConfig {
            sink_buffer: 1,
            max_consecutive_drops: 3,
        });
        registry.open_job("j1").await;
        let mut slow = registry.open_sink("j1").await.unwrap();
        let mut fast = registry.open_sink("j1").await.unwrap();

        // 慢消费者不取走事件：1 条入缓冲，随后连续丢弃直至被断开
        for i in 0..6 {
            registry.publish("j1", progress(&format!("{}", i))).await.unwrap();
            // fast 持续消费，永不掉队
            let ev = fast.rx.recv().await.unwrap();
            assert_eq!(ev.seq, i as u64);
        }

        // 被断开后通道关闭；已入缓冲的事件仍按原顺序可读
        let first = slow.rx.recv().await.unwrap();
        assert_eq!(first.seq, 0);
        assert!(slow.rx.recv().await.is_none(), "slow sink should be disconnected");
    }

    #[tokio::test]
    async fn test_losing_last_sink_does_not_cancel_job() {
        let registry = SessionRegistry::new(SessionConfig::default());
        registry.open_job("j1").await;
        let sink = registry.open_sink("j1").await.unwrap();
        registry.close_sink("j1", &sink.sink_id).await;

        assert!(!registry.is_cancelled("j1").await);
        // 仍可继续发布
        assert!(registry.publish("j1", progress("x")).await.is_ok());

        registry.cancel_job("j1").await;
        assert!(registry.is_cancelled("j1").await);
    }

    #[tokio::test]
    async fn test_cleanup_removes_finished_idle_jobs() {
        let registry = SessionRegistry::new(SessionConfig::default());
        registry.open_job("j1").await;
        registry.open_job("j2").await;
        registry.publish("j1", EventPayload::StreamEnd).await.unwrap();

        // j1 已完成且无 sink，零保留期下被回收；j2 未完成保留
        assert_eq!(
            registry.cleanup_expired(Duration::ZERO).await,
            vec!["j1".to_string()]
        );
        assert!(registry.job_status("j1").await.is_none());
        assert!(registry.job_status("j2").await.is_some());
    }

    #[tokio::test]
    async fn test_publish_to_unknown_job_fails() {
        let registry = SessionRegistry::new(SessionConfig::default());
        let err = registry.publish("nope", EventPayload::Start).await.unwrap_err();
        assert!(matches!(err, StreamError::JobNotFound(_)));
    }
}
