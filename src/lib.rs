//! Waggle - 智能体实时通信层
//!
//! 把 Agent 的推理与工具活动以带类型事件流式推给远端客户端，并允许
//! Agent 在任务中途阻塞式提问、等人回答，同时不打乱事件顺序、不拖住
//! 无关工作。
//!
//! 模块划分：
//! - **classifier**: 标签感知的流式分类器（纯状态机，跨 chunk 不变）
//! - **event**: 输出事件协议（SSE `data:` 帧的 JSON 载荷）
//! - **question**: 提问注册表（create / resolve / expire / cancel，至多结算一次）
//! - **session**: 会话注册表（任务 -> sink 扇出、seq 分配、慢消费者隔离）
//! - **adapter**: Agent 事件桥（文本增量 -> progress，阻塞式 ask()）
//! - **server**: HTTP 服务层（SSE 事件流端点 + 答案回传端点）
//! - **consumer**: 客户端流消费者（暂停/恢复状态机、重试提交、静默看门狗）
//! - **config**: 应用配置加载（TOML + 环境变量）

pub mod adapter;
pub mod classifier;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod observability;
pub mod question;
pub mod server;
pub mod session;

pub use adapter::{AgentEventAdapter, QuestionChannel};
pub use classifier::{ContentSegment, SegmentKind, TagClassifier, TagPolicy};
pub use error::StreamError;
pub use event::{EventPayload, OutputEvent};
pub use question::{QuestionKind, QuestionRegistry, TimeoutPolicy};
pub use session::{SessionRegistry, SinkHandle};
