//! 错误类型
//!
//! 分类器与注册表内的异常（标签畸形、超时、取消、慢消费者）在正常运行中
//! 不以错误形式向上抛出，而是转化为显式状态（Expired / Cancelled / 断开 sink）
//! 并通过事件对外可见；只有真正意外的传输 I/O 失败以硬错误终止任务。

use thiserror::Error;

/// 实时通信层错误
#[derive(Error, Debug)]
pub enum StreamError {
    /// 提问超时且策略为 fail-fast（任务级错误，非崩溃）
    #[error("Question timeout: {0}")]
    QuestionTimeout(String),

    /// 任务被取消（协作式，阻塞中的 ask() 以此解除）
    #[error("Job cancelled: {0}")]
    JobCancelled(String),

    /// 传输失败（网络错误、连接静默挂死、重试耗尽）
    #[error("Transport failure: {0}")]
    Transport(String),

    /// 任务不存在
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Serialize error: {0}")]
    Serialize(String),
}
