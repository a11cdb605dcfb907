//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete（非流式，供 Analyzer 与摘要使用）、
//! complete_stream（流式，返回增量块序列，可携带工具调用请求）。
//! 模型流是惰性、有限、不可重启的序列。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::memory::Message;

/// 模型请求调用某个工具
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// 模型流中的一个增量块
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    /// 文本增量（可为空，如纯工具调用块）
    pub text_delta: String,
    /// 该增量是否为推理内容（不落入最终消息正文）
    pub is_reasoning: bool,
    /// 工具调用请求；同一模型轮次可出现多个
    pub tool_call: Option<ToolCallRequest>,
}

impl StreamChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            text_delta: delta.into(),
            ..Self::default()
        }
    }

    pub fn reasoning(delta: impl Into<String>) -> Self {
        Self {
            text_delta: delta.into(),
            is_reasoning: true,
            ..Self::default()
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            tool_call: Some(ToolCallRequest {
                name: name.into(),
                arguments,
            }),
            ..Self::default()
        }
    }
}

/// 能力集中暴露给模型的单个工具说明
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// 增量块流
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, String>> + Send>>;

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 流式完成；tools 为本轮暴露给模型的能力集（可为空）
    async fn complete_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ChunkStream, String>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }

    /// 后端标识，写入 assistant 消息的 provider 字段
    fn provider(&self) -> &str {
        "unknown"
    }
}
