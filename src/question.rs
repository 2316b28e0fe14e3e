//! 提问注册表：任务内待回答问题的唯一可变入口
//!
//! Agent 提问 -> Pending；回答 / 超时 / 取消是仅有的三条出口路径，
//! 每个问题至多结算一次。create / resolve / expire / cancel 通过同一把锁
//! 串行化（单写者纪律），诊断读取拿快照。
//! 结算后的问题保留一个窗口期供重复提交去重，之后被清扫移除。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};

/// 问题类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    /// 从 choices 中单选
    Select,
    /// 自由文本输入
    Input,
    /// 是/否确认
    Confirmation,
    /// 密文输入（客户端不回显）
    Password,
}

/// 问题状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionState {
    Pending,
    Answered,
    Expired,
    Cancelled,
}

/// 超时策略：fail-fast 以任务级错误收场，use-fallback 以配置的默认答案放行
#[derive(Debug, Clone)]
pub enum TimeoutPolicy {
    FailFast,
    UseFallback(String),
}

/// 问题的最终结算结果（ask() 的等待方由此解除阻塞）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerOutcome {
    /// 外部正常回答
    Answered(String),
    /// 超时，按策略以默认答案放行
    Fallback(String),
    /// 超时，fail-fast
    Expired,
    /// 任务被取消
    Cancelled,
}

/// 单个问题
#[derive(Debug, Clone, Serialize)]
pub struct Question {
    pub id: String,
    pub job_id: String,
    pub kind: QuestionKind,
    pub prompt: String,
    pub choices: Option<Vec<String>>,
    /// Unix 毫秒
    pub created_at: i64,
    /// Unix 毫秒，None 表示无期限
    pub deadline: Option<i64>,
    pub state: QuestionState,
}

struct Entry {
    question: Question,
    /// Pending 期间存在；结算时 take 并发送，天然保证至多一次
    tx: Option<oneshot::Sender<AnswerOutcome>>,
    /// 结算时刻（保留窗口起点）
    settled_at: Option<Instant>,
}

/// 提问注册表
pub struct QuestionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    policy: TimeoutPolicy,
}

impl QuestionRegistry {
    pub fn new(policy: TimeoutPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            policy,
        }
    }

    /// 注册一个 Pending 问题，返回问题与等待结算的 future
    ///
    /// 传入 timeout 时启动期限定时器，到期自动 expire。
    pub async fn create(
        self: &Arc<Self>,
        job_id: &str,
        kind: QuestionKind,
        prompt: &str,
        choices: Option<Vec<String>>,
        timeout: Option<Duration>,
    ) -> (Question, oneshot::Receiver<AnswerOutcome>) {
        let id = format!("q_{}", uuid::Uuid::new_v4());
        let now = chrono::Utc::now().timestamp_millis();
        let question = Question {
            id: id.clone(),
            job_id: job_id.to_string(),
            kind,
            prompt: prompt.to_string(),
            choices,
            created_at: now,
            deadline: timeout.map(|t| now + t.as_millis() as i64),
            state: QuestionState::Pending,
        };

        let (tx, rx) = oneshot::channel();
        self.entries.lock().await.insert(
            id.clone(),
            Entry {
                question: question.clone(),
                tx: Some(tx),
                settled_at: None,
            },
        );

        if let Some(timeout) = timeout {
            let registry = Arc::clone(self);
            let question_id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                registry.expire(&question_id).await;
            });
        }

        (question, rx)
    }

    /// 回答一个问题：Pending -> Answered
    ///
    /// 幂等：非 Pending（重复提交、已超时、未知 ID）一律返回 false，无副作用。
    pub async fn resolve(&self, question_id: &str, answer: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(question_id) else {
            return false;
        };
        if entry.question.state != QuestionState::Pending {
            return false;
        }
        entry.question.state = QuestionState::Answered;
        entry.settled_at = Some(Instant::now());
        if let Some(tx) = entry.tx.take() {
            let _ = tx.send(AnswerOutcome::Answered(answer.to_string()));
        }
        tracing::debug!("Question {} answered", question_id);
        true
    }

    /// 期限到期：Pending -> Expired，按策略结算等待方（fail-fast 或 fallback）
    pub async fn expire(&self, question_id: &str) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(question_id) else {
            return;
        };
        if entry.question.state != QuestionState::Pending {
            return;
        }
        entry.question.state = QuestionState::Expired;
        entry.settled_at = Some(Instant::now());
        let outcome = match &self.policy {
            TimeoutPolicy::FailFast => AnswerOutcome::Expired,
            TimeoutPolicy::UseFallback(fallback) => AnswerOutcome::Fallback(fallback.clone()),
        };
        if let Some(tx) = entry.tx.take() {
            let _ = tx.send(outcome);
        }
        tracing::warn!("Question {} expired", question_id);
    }

    /// 任务中止：批量取消该任务的所有 Pending 问题，解除全部等待方
    pub async fn cancel(&self, job_id: &str) {
        let mut entries = self.entries.lock().await;
        let mut cancelled = 0usize;
        for entry in entries.values_mut() {
            if entry.question.job_id == job_id && entry.question.state == QuestionState::Pending {
                entry.question.state = QuestionState::Cancelled;
                entry.settled_at = Some(Instant::now());
                if let Some(tx) = entry.tx.take() {
                    let _ = tx.send(AnswerOutcome::Cancelled);
                }
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::info!("Cancelled {} pending question(s) for job {}", cancelled, job_id);
        }
    }

    /// 清扫：移除结算超过保留窗口的问题，返回移除数量
    pub async fn evict_resolved(&self, retention: Duration) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| match entry.settled_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
        before - entries.len()
    }

    /// 任务销毁时移除其全部问题（含 Pending，先行取消）
    pub async fn remove_job(&self, job_id: &str) {
        self.cancel(job_id).await;
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.question.job_id != job_id);
    }

    /// 问题是否仍在注册表中（答案端点区分 404 与幂等拒绝用）
    pub async fn contains(&self, question_id: &str) -> bool {
        self.entries.lock().await.contains_key(question_id)
    }

    /// 诊断快照
    pub async fn snapshot(&self, job_id: &str) -> Vec<Question> {
        let entries = self.entries.lock().await;
        entries
            .values()
            .filter(|e| e.question.job_id == job_id)
            .map(|e| e.question.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let registry = Arc::new(QuestionRegistry::new(TimeoutPolicy::FailFast));
        let (question, rx) = registry
            .create("job_1", QuestionKind::Input, "Name?", None, None)
            .await;

        assert!(registry.resolve(&question.id, "first").await);
        // 第二次 resolve（无论载荷）返回 false 且不改写首个答案
        assert!(!registry.resolve(&question.id, "second").await);

        assert_eq!(rx.await.unwrap(), AnswerOutcome::Answered("first".to_string()));
        let snap = registry.snapshot("job_1").await;
        assert_eq!(snap[0].state, QuestionState::Answered);
    }

    #[tokio::test]
    async fn test_resolve_unknown_id_is_noop() {
        let registry = Arc::new(QuestionRegistry::new(TimeoutPolicy::FailFast));
        assert!(!registry.resolve("q_missing", "x").await);
    }

    #[tokio::test]
    async fn test_fallback_timeout_settles_within_window() {
        let registry = Arc::new(QuestionRegistry::new(TimeoutPolicy::UseFallback(
            "No".to_string(),
        )));
        let (_, rx) = registry
            .create(
                "job_1",
                QuestionKind::Confirmation,
                "Proceed?",
                None,
                Some(Duration::from_millis(100)),
            )
            .await;

        let started = Instant::now();
        let outcome = rx.await.unwrap();
        let elapsed = started.elapsed();
        assert_eq!(outcome, AnswerOutcome::Fallback("No".to_string()));
        assert!(elapsed >= Duration::from_millis(90), "settled too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(300), "settled too late: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_fail_fast_timeout_rejects() {
        let registry = Arc::new(QuestionRegistry::new(TimeoutPolicy::FailFast));
        let (question, rx) = registry
            .create(
                "job_1",
                QuestionKind::Input,
                "Name?",
                None,
                Some(Duration::from_millis(50)),
            )
            .await;

        assert_eq!(rx.await.unwrap(), AnswerOutcome::Expired);
        // 过期后提交同样幂等拒绝
        assert!(!registry.resolve(&question.id, "late").await);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_all_pending() {
        let registry = Arc::new(QuestionRegistry::new(TimeoutPolicy::FailFast));
        let (_, rx1) = registry
            .create("job_1", QuestionKind::Input, "A?", None, None)
            .await;
        let (_, rx2) = registry
            .create("job_1", QuestionKind::Input, "B?", None, None)
            .await;
        let (q3, _rx3) = registry
            .create("job_2", QuestionKind::Input, "C?", None, None)
            .await;

        registry.cancel("job_1").await;
        assert_eq!(rx1.await.unwrap(), AnswerOutcome::Cancelled);
        assert_eq!(rx2.await.unwrap(), AnswerOutcome::Cancelled);
        // 其他任务不受影响
        assert!(registry.resolve(&q3.id, "ok").await);
    }

    #[tokio::test]
    async fn test_remove_job_takes_pending_questions_along() {
        let registry = Arc::new(QuestionRegistry::new(TimeoutPolicy::FailFast));
        let (_, rx) = registry
            .create("job_1", QuestionKind::Input, "A?", None, None)
            .await;
        let (q2, _rx2) = registry
            .create("job_2", QuestionKind::Input, "B?", None, None)
            .await;

        registry.remove_job("job_1").await;
        // Pending 被先行取消再移除，等待方解除，不留死等
        assert_eq!(rx.await.unwrap(), AnswerOutcome::Cancelled);
        assert!(registry.snapshot("job_1").await.is_empty());
        // 其他任务不受影响
        assert!(registry.resolve(&q2.id, "ok").await);
    }

    #[tokio::test]
    async fn test_evict_resolved_after_retention() {
        let registry = Arc::new(QuestionRegistry::new(TimeoutPolicy::FailFast));
        let (question, _rx) = registry
            .create("job_1", QuestionKind::Input, "A?", None, None)
            .await;
        registry.resolve(&question.id, "done").await;

        assert_eq!(registry.evict_resolved(Duration::from_secs(60)).await, 0);
        assert_eq!(registry.evict_resolved(Duration::ZERO).await, 1);
        assert!(registry.snapshot("job_1").await.is_empty());
    }
}
