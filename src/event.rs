//! 输出事件协议：任务流式过程事件（SSE `data:` 帧的 JSON 载荷）
//!
//! 统一的事件格式，用于 SessionRegistry 与各客户端之间的通信。
//! 每个事件携带 jobId、单任务内单调递增的 seq 与毫秒时间戳。

use serde::{Deserialize, Serialize};

use crate::classifier::{ContentSegment, SegmentKind};

/// 单条输出事件（信封：jobId + seq + timestamp + 载荷）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEvent {
    /// 所属任务 ID
    #[serde(rename = "jobId")]
    pub job_id: String,
    /// 单任务内单调递增序号（每个 sink 观察到严格递增，允许空洞）
    pub seq: u64,
    /// Unix 毫秒时间戳
    pub timestamp: i64,
    /// 事件载荷
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// 事件载荷类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// 任务开始
    Start,
    /// 分类后的流式内容片段
    Progress {
        message: String,
        #[serde(rename = "contentType")]
        content_type: SegmentKind,
        #[serde(rename = "toolName", skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
    },
    /// 工具调用通知
    ToolUse {
        tool: String,
        args: serde_json::Value,
    },
    /// Token 使用统计
    TokenUsage {
        #[serde(rename = "promptTokens")]
        prompt_tokens: u64,
        #[serde(rename = "completionTokens")]
        completion_tokens: u64,
        #[serde(rename = "totalTokens")]
        total_tokens: u64,
    },
    /// 向客户端提问（阻塞 Agent 直至答案回传）
    QuestionAsk {
        #[serde(rename = "questionId")]
        question_id: String,
        #[serde(rename = "questionType")]
        question_type: crate::question::QuestionKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        choices: Option<Vec<String>>,
    },
    /// 任务完成
    Completion {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// 事件流结束（终帧）
    StreamEnd,
    /// 任务级错误（超时 fail-fast、传输失败等）
    Error { text: String },
}

impl EventPayload {
    /// 从分类片段构造 Progress 载荷
    pub fn progress(segment: ContentSegment) -> Self {
        EventPayload::Progress {
            message: segment.text,
            content_type: segment.kind,
            tool_name: segment.tool_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let ev = OutputEvent {
            job_id: "job_1".to_string(),
            seq: 3,
            timestamp: 1700000000000,
            payload: EventPayload::Progress {
                message: "Plan: ".to_string(),
                content_type: SegmentKind::Content,
                tool_name: None,
            },
        };
        let json: serde_json::Value = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["jobId"], "job_1");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["message"], "Plan: ");
        assert_eq!(json["contentType"], "content");
        assert!(json.get("toolName").is_none());

        let back: OutputEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.seq, 3);
    }

    #[test]
    fn test_question_ask_wire_shape() {
        let ev = OutputEvent {
            job_id: "job_1".to_string(),
            seq: 0,
            timestamp: 0,
            payload: EventPayload::QuestionAsk {
                question_id: "q_1".to_string(),
                question_type: crate::question::QuestionKind::Select,
                message: "Proceed?".to_string(),
                choices: Some(vec!["Yes".to_string(), "No".to_string()]),
            },
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "question_ask");
        assert_eq!(json["questionId"], "q_1");
        assert_eq!(json["questionType"], "select");
        assert_eq!(json["choices"][1], "No");
    }
}
