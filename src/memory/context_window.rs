//! 上下文窗口构建
//!
//! 在 token 预算内为一次轮次挑选进入模型的消息序列。三种溢出策略：
//! NONE 原样透传、超限报错；SLIDING_WINDOW 保留最近的最长后缀；
//! SUMMARIZE 把放不下的旧消息压缩为一条合成 SYSTEM 摘要，失败时退回 SLIDING_WINDOW。
//! 窗口是轮次内的瞬时值，不持久化。

use std::sync::Arc;

use crate::core::TurnError;
use crate::llm::LlmClient;
use crate::memory::{Message, TokenEstimator};

/// 溢出策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowStrategy {
    /// 透传；超预算时返回 OverflowError，由调用方决策
    None,
    /// 丢弃最旧的消息，保留预算内最近的后缀
    SlidingWindow,
    /// 旧消息压缩为一条摘要消息
    Summarize,
}

impl OverflowStrategy {
    /// 解析配置字符串（NONE / SLIDING_WINDOW / SUMMARIZE，大小写不敏感）
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NONE" => Some(Self::None),
            "SLIDING_WINDOW" => Some(Self::SlidingWindow),
            "SUMMARIZE" => Some(Self::Summarize),
            _ => None,
        }
    }
}

/// 构建完成的上下文窗口：system prompt 恒为首条，总 token 不超预算
#[derive(Debug, Clone)]
pub struct ContextWindow {
    messages: Vec<Message>,
    token_count: usize,
    has_summary: bool,
}

impl ContextWindow {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    /// 本次构建是否注入了摘要消息
    pub fn has_summary(&self) -> bool {
        self.has_summary
    }
}

/// 摘要调用参数：分块字符数与重叠
#[derive(Debug, Clone)]
pub struct SummarizeConfig {
    pub chunk_chars: usize,
    pub overlap_chars: usize,
    /// 摘要消息在窗口内的 token 上限
    pub max_summary_tokens: usize,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            chunk_chars: 4000,
            overlap_chars: 200,
            max_summary_tokens: 512,
        }
    }
}

const SUMMARY_PROMPT: &str = "Summarize the following conversation excerpt in a few sentences. \
Keep facts, decisions and unresolved points. Output only the summary.";

/// 上下文窗口管理器：无跨调用状态，摘要后端可选
#[derive(Default)]
pub struct ContextWindowManager {
    summarizer: Option<Arc<dyn LlmClient>>,
    summarize_cfg: SummarizeConfig,
}

impl ContextWindowManager {
    pub fn new() -> Self {
        Self {
            summarizer: None,
            summarize_cfg: SummarizeConfig::default(),
        }
    }

    /// 设置摘要后端与分块参数（SUMMARIZE 策略需要）
    pub fn with_summarizer(mut self, llm: Arc<dyn LlmClient>, cfg: SummarizeConfig) -> Self {
        self.summarizer = Some(llm);
        self.summarize_cfg = cfg;
        self
    }

    /// 构建窗口。system_prompt 恒为首条；保留消息维持原始顺序；
    /// SLIDING_WINDOW / SUMMARIZE 下结果 token 数严格 ≤ budget。
    pub async fn build(
        &self,
        history: &[Message],
        system_prompt: &Message,
        budget: usize,
        strategy: OverflowStrategy,
    ) -> Result<ContextWindow, TurnError> {
        let sys_tokens = TokenEstimator::estimate_message(system_prompt);
        let history_tokens = TokenEstimator::estimate_messages(history);
        let total = sys_tokens + history_tokens;

        match strategy {
            OverflowStrategy::None => {
                if total > budget {
                    return Err(TurnError::Overflow {
                        used: total,
                        budget,
                    });
                }
                Ok(Self::assemble(system_prompt, None, history, total))
            }
            OverflowStrategy::SlidingWindow => {
                Ok(self.sliding_window(history, system_prompt, budget, sys_tokens))
            }
            OverflowStrategy::Summarize => {
                if total <= budget {
                    // 无需截断：不注入摘要
                    return Ok(Self::assemble(system_prompt, None, history, total));
                }
                match self.summarize_window(history, system_prompt, budget, sys_tokens).await {
                    Ok(window) => Ok(window),
                    Err(reason) => {
                        tracing::warn!(
                            "Summarization failed ({}), falling back to sliding window",
                            reason
                        );
                        Ok(self.sliding_window(history, system_prompt, budget, sys_tokens))
                    }
                }
            }
        }
    }

    /// 预算内最近消息的最长后缀，原始顺序
    fn sliding_window(
        &self,
        history: &[Message],
        system_prompt: &Message,
        budget: usize,
        sys_tokens: usize,
    ) -> ContextWindow {
        let available = budget.saturating_sub(sys_tokens);
        let (start, used) = Self::longest_suffix(history, available);
        Self::assemble(system_prompt, None, &history[start..], sys_tokens + used)
    }

    /// 旧消息压缩为一条合成 SYSTEM 摘要，紧跟 system prompt 之后
    async fn summarize_window(
        &self,
        history: &[Message],
        system_prompt: &Message,
        budget: usize,
        sys_tokens: usize,
    ) -> Result<ContextWindow, String> {
        let llm = self
            .summarizer
            .as_ref()
            .ok_or_else(|| "no summarizer configured".to_string())?;

        let reserve = self
            .summarize_cfg
            .max_summary_tokens
            .min(budget.saturating_sub(sys_tokens));
        let available = budget.saturating_sub(sys_tokens + reserve);
        let (start, suffix_tokens) = Self::longest_suffix(history, available);

        let dropped_text = history[..start]
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let raw_summary = self.summarize_text(llm.as_ref(), &dropped_text).await?;
        let summary_text = TokenEstimator::truncate_to_tokens(&raw_summary, reserve.max(1));
        let summary = Message::system(format!("Previous conversation summary:\n{}", summary_text));
        let summary_tokens = TokenEstimator::estimate_message(&summary);

        // 摘要前缀（固定文案）可能挤占预留；超出时对摘要再截断一次
        let summary = if summary_tokens > reserve {
            let retrimmed =
                TokenEstimator::truncate_to_tokens(&summary.content, reserve.max(1));
            Message::system(retrimmed)
        } else {
            summary
        };
        let summary_tokens = TokenEstimator::estimate_message(&summary);

        Ok(Self::assemble(
            system_prompt,
            Some(summary),
            &history[start..],
            sys_tokens + summary_tokens + suffix_tokens,
        ))
    }

    /// 分块调用外部文本生成得到摘要；任一块失败即整体失败
    async fn summarize_text(&self, llm: &dyn LlmClient, text: &str) -> Result<String, String> {
        let mut parts = Vec::new();
        for chunk in split_chunks(
            text,
            self.summarize_cfg.chunk_chars,
            self.summarize_cfg.overlap_chars,
        ) {
            let messages = vec![Message::system(SUMMARY_PROMPT), Message::user(chunk)];
            parts.push(llm.complete(&messages).await?);
        }
        Ok(parts.join("\n"))
    }

    /// 返回 (起始下标, 后缀 token 数)：history[start..] 是 token 和 ≤ available 的最长后缀
    fn longest_suffix(history: &[Message], available: usize) -> (usize, usize) {
        let mut used = 0usize;
        let mut start = history.len();
        for (i, msg) in history.iter().enumerate().rev() {
            let t = TokenEstimator::estimate_message(msg);
            if used + t > available {
                break;
            }
            used += t;
            start = i;
        }
        (start, used)
    }

    fn assemble(
        system_prompt: &Message,
        summary: Option<Message>,
        suffix: &[Message],
        token_count: usize,
    ) -> ContextWindow {
        let mut messages = Vec::with_capacity(suffix.len() + 2);
        messages.push(system_prompt.clone());
        let has_summary = summary.is_some();
        if let Some(s) = summary {
            messages.push(s);
        }
        messages.extend_from_slice(suffix);
        ContextWindow {
            messages,
            token_count,
            has_summary,
        }
    }
}

/// 按字符数分块，相邻块保留 overlap 重叠
fn split_chunks(text: &str, chunk_chars: usize, overlap_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    let chunk_chars = chunk_chars.max(1);
    let step = chunk_chars.saturating_sub(overlap_chars).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_chars).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}
