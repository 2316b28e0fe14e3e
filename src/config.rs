//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WAGGLE__*` 覆盖
//! （双下划线表示嵌套，如 `WAGGLE__QUESTION__TIMEOUT_POLICY=use_fallback`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub question: QuestionSection,
    pub session: SessionSection,
    pub client: ClientSection,
}

/// [server] 段：监听地址与 SSE keep-alive 间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_addr: String,
    /// SSE keep-alive 注释帧间隔（秒），即 per-sink 心跳
    pub keepalive_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8600".to_string(),
            keepalive_secs: 15,
        }
    }
}

/// [question] 段：提问期限与超时策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuestionSection {
    /// 问题期限（秒），0 表示无限等待
    pub default_timeout_secs: u64,
    /// 超时策略：fail_fast / use_fallback
    pub timeout_policy: String,
    /// use_fallback 策略下的默认答案
    pub fallback_answer: String,
    /// 结算后的保留窗口（秒），窗口内重复提交可去重
    pub retention_secs: u64,
}

impl Default for QuestionSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            timeout_policy: "fail_fast".to_string(),
            fallback_answer: String::new(),
            retention_secs: 300,
        }
    }
}

impl QuestionSection {
    /// 期限配置转 Duration，0 表示无限
    pub fn timeout(&self) -> Option<Duration> {
        if self.default_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.default_timeout_secs))
        }
    }
}

/// [session] 段：sink 缓冲、慢消费者阈值与任务保留
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub sink_buffer: usize,
    pub max_consecutive_drops: u32,
    /// 任务完成且最后一个 sink 离线后的保留窗口（秒）
    pub job_retention_secs: u64,
    /// 清扫周期（秒）
    pub cleanup_interval_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            sink_buffer: 256,
            max_consecutive_drops: 8,
            job_retention_secs: 600,
            cleanup_interval_secs: 60,
        }
    }
}

/// [client] 段：答案提交重试与静默超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// 答案提交最大尝试次数
    pub answer_max_retries: u32,
    /// 指数退避基础延迟（毫秒）
    pub answer_base_delay_ms: u64,
    /// 滑动静默超时（秒）：每收到一个字节重置，触发即视为连接死亡
    pub inactivity_timeout_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            answer_max_retries: 5,
            answer_base_delay_ms: 200,
            inactivity_timeout_secs: 90,
        }
    }
}

/// 从 config 目录加载配置，环境变量 WAGGLE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 WAGGLE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WAGGLE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.keepalive_secs, 15);
        assert_eq!(config.question.timeout_policy, "fail_fast");
        assert_eq!(config.question.timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.client.answer_max_retries, 5);
    }

    #[test]
    fn test_zero_timeout_means_unbounded() {
        let section = QuestionSection {
            default_timeout_secs: 0,
            ..QuestionSection::default()
        };
        assert_eq!(section.timeout(), None);
    }
}
