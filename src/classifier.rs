//! 标签感知的流式分类器
//!
//! 将 LLM 增量输出的无类型字符流切分为带类型的内容片段（正文 / 思考 /
//! 工具调用 / 工具结果 / 系统）。纯状态机，无 I/O，不阻塞；跨 feed 调用
//! 保持半个标签的缓冲，保证任意切分点下的分类结果与整段输入一致。
//!
//! 每个任务持有一个独立实例（由调用方显式拥有，禁止全局可变状态）。

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// 片段类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    /// 普通正文
    Content,
    /// 思考 / 推理内容
    Thinking,
    /// 工具调用包裹标签内的内容
    ToolCall,
    /// 工具结果
    ToolResult,
    /// 系统注入内容
    System,
}

/// 带类型的内容片段（可能是某个标签跨度的一部分）
///
/// `complete == true` 表示该跨度的闭合边界已被观察到。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSegment {
    pub kind: SegmentKind,
    /// 工具调用包裹标签内识别出的工具名（如有）
    pub tool_name: Option<String>,
    pub text: String,
    pub complete: bool,
}

/// 标签可见性：展示或整体吞掉
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagVisibility {
    Emit,
    Suppress,
}

/// 可见性策略表：已知标签名 -> 展示/抑制；未知标签走默认值
///
/// 默认抑制 `thinking`、完成包裹标签与工具调用包裹标签，其余展示。
#[derive(Debug, Clone)]
pub struct TagPolicy {
    rules: HashMap<String, TagVisibility>,
    default: TagVisibility,
    /// 工具调用包裹标签名（其内第一个嵌套标签名作为工具名）
    tool_wrapper: String,
}

impl Default for TagPolicy {
    fn default() -> Self {
        let mut rules = HashMap::new();
        rules.insert("thinking".to_string(), TagVisibility::Suppress);
        rules.insert("attempt_completion".to_string(), TagVisibility::Suppress);
        rules.insert("use_tool".to_string(), TagVisibility::Suppress);
        rules.insert("tool_result".to_string(), TagVisibility::Emit);
        rules.insert("system".to_string(), TagVisibility::Emit);
        Self {
            rules,
            default: TagVisibility::Emit,
            tool_wrapper: "use_tool".to_string(),
        }
    }
}

impl TagPolicy {
    /// 覆盖单个标签的可见性
    pub fn with_rule(mut self, name: &str, visibility: TagVisibility) -> Self {
        self.rules.insert(name.to_lowercase(), visibility);
        self
    }

    /// 设置未知标签的默认可见性
    pub fn with_default(mut self, visibility: TagVisibility) -> Self {
        self.default = visibility;
        self
    }

    fn visibility(&self, name: &str) -> TagVisibility {
        self.rules.get(name).copied().unwrap_or(self.default)
    }

    fn kind(&self, name: &str) -> SegmentKind {
        if name == self.tool_wrapper {
            return SegmentKind::ToolCall;
        }
        match name {
            "thinking" => SegmentKind::Thinking,
            "tool_result" => SegmentKind::ToolResult,
            "system" => SegmentKind::System,
            _ => SegmentKind::Content,
        }
    }
}

/// 状态机状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// 普通文本
    Normal,
    /// `<` 之后，累积候选开标签名
    TagOpen,
    /// 在已识别标签内部（stack 非空）
    InsideTag,
    /// `</` 之后，累积候选闭标签名
    TagClose,
}

/// 当前最外层标签跨度信息（可见性与类型由最外层决定，子树整体继承）
#[derive(Debug, Clone)]
struct SpanInfo {
    kind: SegmentKind,
    visibility: TagVisibility,
    tool_name: Option<String>,
}

/// 标签分类器（每任务一个实例）
pub struct TagClassifier {
    policy: TagPolicy,
    name_re: Regex,
    state: State,
    /// 未决 token 的原始字节（含 `<` / `</` 前缀），跨 feed 保持
    pending: String,
    /// 未决 token 的候选标签名
    candidate: String,
    /// 当前片段已累积文本
    buf: String,
    /// 打开中的标签名栈（小写），栈底为最外层
    stack: Vec<String>,
    /// 最外层跨度信息，stack 非空时存在
    span: Option<SpanInfo>,
}

impl TagClassifier {
    pub fn new(policy: TagPolicy) -> Self {
        Self {
            policy,
            // 候选名合法性：[a-z][a-z0-9_-]*，大小写不敏感
            name_re: Regex::new(r"(?i)^[a-z][a-z0-9_-]*$").unwrap(),
            state: State::Normal,
            pending: String::new(),
            candidate: String::new(),
            buf: String::new(),
            stack: Vec::new(),
            span: None,
        }
    }

    /// 喂入一段文本，返回本次发现的片段序列
    ///
    /// 可反复调用；跨调用被截断的 token（如 `<thin`）不会被提前输出，
    /// 完整标签到齐后的处理结果与单次输入完全一致。
    pub fn feed(&mut self, fragment: &str) -> Vec<ContentSegment> {
        let mut out = Vec::new();
        for ch in fragment.chars() {
            self.step(ch, &mut out);
        }
        // feed 末尾：已累积文本作为未闭合片段流出（半个 token 继续持有）
        self.flush_partial(&mut out);
        out
    }

    /// 逻辑消息结束：未决的半个 token 按字面量回吐，残余文本一并流出
    pub fn finish(&mut self) -> Vec<ContentSegment> {
        let mut out = Vec::new();
        if !self.pending.is_empty() {
            let literal = std::mem::take(&mut self.pending);
            self.candidate.clear();
            self.push_text(&literal);
        }
        self.state = if self.stack.is_empty() {
            State::Normal
        } else {
            State::InsideTag
        };
        if self.stack.is_empty() {
            if !self.buf.is_empty() {
                let text = std::mem::take(&mut self.buf);
                out.push(ContentSegment {
                    kind: SegmentKind::Content,
                    tool_name: None,
                    text,
                    complete: true,
                });
            }
        } else {
            // 未闭合标签：可见跨度以未完成片段收尾
            self.flush_partial(&mut out);
        }
        out
    }

    fn step(&mut self, ch: char, out: &mut Vec<ContentSegment>) {
        match self.state {
            State::Normal | State::InsideTag => {
                if ch == '<' {
                    self.pending.push('<');
                    self.candidate.clear();
                    self.state = State::TagOpen;
                } else {
                    self.push_char(ch);
                }
            }
            State::TagOpen => {
                if ch == '/' && self.candidate.is_empty() && self.pending == "<" {
                    self.pending.push('/');
                    self.state = State::TagClose;
                } else if ch == '>' {
                    if self.name_re.is_match(&self.candidate) {
                        let name = self.candidate.to_lowercase();
                        self.candidate.clear();
                        self.handle_open(&name, out);
                    } else {
                        // `<>` 等非法候选：连同 `>` 一起按字面量回吐
                        self.pending.push('>');
                        self.flush_pending_literal();
                    }
                } else if ch == '<' {
                    // 新的 `<` 打断未决 token：旧的按字面量回吐
                    self.flush_pending_literal();
                    self.pending.push('<');
                    self.state = State::TagOpen;
                } else if is_name_char(ch) {
                    self.candidate.push(ch);
                    self.pending.push(ch);
                } else {
                    self.pending.push(ch);
                    self.flush_pending_literal();
                }
            }
            State::TagClose => {
                if ch == '>' {
                    if self.name_re.is_match(&self.candidate) {
                        let name = self.candidate.to_lowercase();
                        self.candidate.clear();
                        self.handle_close(&name, out);
                    } else {
                        self.pending.push('>');
                        self.flush_pending_literal();
                    }
                } else if ch == '<' {
                    self.flush_pending_literal();
                    self.pending.push('<');
                    self.state = State::TagOpen;
                } else if is_name_char(ch) {
                    self.candidate.push(ch);
                    self.pending.push(ch);
                } else {
                    self.pending.push(ch);
                    self.flush_pending_literal();
                }
            }
        }
    }

    /// 确认一个开标签
    fn handle_open(&mut self, name: &str, out: &mut Vec<ContentSegment>) {
        let raw = std::mem::take(&mut self.pending);
        if self.stack.is_empty() {
            // 边界确立：此前的普通文本作为完整片段流出
            if !self.buf.is_empty() {
                let text = std::mem::take(&mut self.buf);
                out.push(ContentSegment {
                    kind: SegmentKind::Content,
                    tool_name: None,
                    text,
                    complete: true,
                });
            }
            self.span = Some(SpanInfo {
                kind: self.policy.kind(name),
                visibility: self.policy.visibility(name),
                tool_name: None,
            });
        } else {
            // 嵌套开标签：整棵子树跟随最外层标签的可见性
            if self.stack.len() == 1 && self.stack[0] == self.policy.tool_wrapper {
                if let Some(span) = self.span.as_mut() {
                    if span.tool_name.is_none() {
                        span.tool_name = Some(name.to_string());
                    }
                }
            }
            if self.span_visible() {
                self.buf.push_str(&raw);
                self.buf.push('>');
            }
        }
        self.stack.push(name.to_string());
        self.state = State::InsideTag;
    }

    /// 确认一个闭标签
    fn handle_close(&mut self, name: &str, out: &mut Vec<ContentSegment>) {
        let raw = std::mem::take(&mut self.pending);
        match self.stack.last() {
            None => {
                // 无任何打开标签时的闭标签：字面量
                self.buf.push_str(&raw);
                self.buf.push('>');
                self.state = State::Normal;
            }
            Some(top) if top == name => {
                self.stack.pop();
                if self.stack.is_empty() {
                    // 最外层跨度闭合
                    let span = self.span.take();
                    if let Some(span) = span {
                        if span.visibility == TagVisibility::Emit {
                            let text = std::mem::take(&mut self.buf);
                            out.push(ContentSegment {
                                kind: span.kind,
                                tool_name: span.tool_name,
                                text,
                                complete: true,
                            });
                        } else {
                            self.buf.clear();
                        }
                    }
                    self.state = State::Normal;
                } else {
                    if self.span_visible() {
                        self.buf.push_str(&raw);
                        self.buf.push('>');
                    }
                    self.state = State::InsideTag;
                }
            }
            Some(_) => {
                // 闭标签与当前打开标签不匹配：按字面量回吐，继续停留在标签内
                if self.span_visible() {
                    self.buf.push_str(&raw);
                    self.buf.push('>');
                }
                self.state = State::InsideTag;
            }
        }
    }

    /// 未决 token 按字面量回吐到当前上下文
    fn flush_pending_literal(&mut self) {
        let literal = std::mem::take(&mut self.pending);
        self.candidate.clear();
        self.push_text(&literal);
        self.state = if self.stack.is_empty() {
            State::Normal
        } else {
            State::InsideTag
        };
    }

    fn push_char(&mut self, ch: char) {
        if self.stack.is_empty() || self.span_visible() {
            self.buf.push(ch);
        }
    }

    fn push_text(&mut self, text: &str) {
        if self.stack.is_empty() || self.span_visible() {
            self.buf.push_str(text);
        }
    }

    fn span_visible(&self) -> bool {
        self.span
            .as_ref()
            .map(|s| s.visibility == TagVisibility::Emit)
            .unwrap_or(false)
    }

    /// feed 末尾把已累积文本作为未完成片段流出（流式展示用）
    fn flush_partial(&mut self, out: &mut Vec<ContentSegment>) {
        if self.buf.is_empty() {
            return;
        }
        let (kind, tool_name, emit) = if self.stack.is_empty() {
            (SegmentKind::Content, None, true)
        } else {
            match self.span.as_ref() {
                Some(span) => (
                    span.kind,
                    span.tool_name.clone(),
                    span.visibility == TagVisibility::Emit,
                ),
                None => (SegmentKind::Content, None, true),
            }
        };
        if emit {
            let text = std::mem::take(&mut self.buf);
            out.push(ContentSegment {
                kind,
                tool_name,
                text,
                complete: false,
            });
        }
    }
}

fn is_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
}
