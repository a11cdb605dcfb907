//! Token 估算
//!
//! 字符计数近似：英文约 4 字符/token，中文约 1.5 字符/token。
//! 上下文窗口构建与摘要截断共用同一套估算，保证预算判定一致。

use crate::memory::Message;

/// Token 估算器
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0usize;
        let mut non_ascii_chars = 0usize;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 估算单条消息的 token 数（只计内容）
    pub fn estimate_message(message: &Message) -> usize {
        Self::estimate(&message.content)
    }

    /// 估算消息序列的累计 token 数
    pub fn estimate_messages(messages: &[Message]) -> usize {
        messages.iter().map(Self::estimate_message).sum()
    }

    /// 将文本截断到不超过 max_tokens，保留开头部分
    pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
        let estimated = Self::estimate(text);
        if estimated <= max_tokens {
            return text.to_string();
        }

        // 按比例截断并留 10% 余量，避免估算误差导致超限
        let ratio = max_tokens as f64 / estimated as f64;
        let target_chars = (text.chars().count() as f64 * ratio * 0.9) as usize;
        let truncated: String = text.chars().take(target_chars).collect();
        truncated.trim_end().to_string()
    }
}
