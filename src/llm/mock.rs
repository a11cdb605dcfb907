//! Mock LLM 客户端（用于测试，无需 API）
//!
//! complete 与 complete_stream 从预置脚本队列中依次弹出；队列耗尽时回显最后一条
//! User 消息，便于在没有 API Key 的环境跑通整个轮次流程。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{ChunkStream, LlmClient, StreamChunk, ToolSpec};
use crate::memory::{Message, Role};

/// 流式回显时每块字符数
const CHUNK_CHARS: usize = 6;

/// Mock 客户端：脚本化回复 + 回显兜底
#[derive(Default)]
pub struct MockLlmClient {
    completions: Mutex<VecDeque<Result<String, String>>>,
    streams: Mutex<VecDeque<Vec<Result<StreamChunk, String>>>>,
    /// 每个增量块之间的延迟（用于取消时序测试）
    chunk_delay: Option<Duration>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// 预置一条非流式回复
    pub fn push_completion(&self, content: impl Into<String>) {
        self.completions
            .lock()
            .unwrap()
            .push_back(Ok(content.into()));
    }

    /// 预置一条非流式错误
    pub fn push_completion_err(&self, error: impl Into<String>) {
        self.completions
            .lock()
            .unwrap()
            .push_back(Err(error.into()));
    }

    /// 预置一次流式回复的完整块序列
    pub fn push_stream(&self, chunks: Vec<Result<StreamChunk, String>>) {
        self.streams.lock().unwrap().push_back(chunks);
    }

    /// 预置一次纯文本流式回复（按 CHUNK_CHARS 切块）
    pub fn push_text_stream(&self, text: &str) {
        let chars: Vec<char> = text.chars().collect();
        let chunks = chars
            .chunks(CHUNK_CHARS)
            .map(|c| Ok(StreamChunk::text(c.iter().collect::<String>())))
            .collect();
        self.push_stream(chunks);
    }

    fn echo(&self, messages: &[Message]) -> String {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        format!("Echo from Mock: {}", last_user)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Some(scripted) = self.completions.lock().unwrap().pop_front() {
            return scripted;
        }
        Ok(self.echo(messages))
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        _tools: &[ToolSpec],
    ) -> Result<ChunkStream, String> {
        let script = self.streams.lock().unwrap().pop_front();
        let chunks: VecDeque<Result<StreamChunk, String>> = match script {
            Some(chunks) => chunks.into(),
            None => {
                let content = self.echo(messages);
                let chars: Vec<char> = content.chars().collect();
                chars
                    .chunks(CHUNK_CHARS)
                    .map(|c| Ok(StreamChunk::text(c.iter().collect::<String>())))
                    .collect()
            }
        };

        let delay = self.chunk_delay;
        let stream = stream::unfold(chunks, move |mut remaining| async move {
            let item = remaining.pop_front()?;
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            Some((item, remaining))
        });
        Ok(Box::pin(stream))
    }

    fn provider(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn scripted_completions_pop_in_order() {
        let mock = MockLlmClient::new();
        mock.push_completion("first");
        mock.push_completion("second");

        assert_eq!(mock.complete(&[]).await.unwrap(), "first");
        assert_eq!(mock.complete(&[]).await.unwrap(), "second");
        // 脚本耗尽后回显
        let echoed = mock.complete(&[Message::user("hi")]).await.unwrap();
        assert!(echoed.contains("hi"));
    }

    #[tokio::test]
    async fn scripted_stream_preserves_chunk_order() {
        let mock = MockLlmClient::new();
        mock.push_stream(vec![
            Ok(StreamChunk::text("a")),
            Ok(StreamChunk::tool_call("search", serde_json::json!({"q": "x"}))),
            Ok(StreamChunk::text("b")),
        ]);

        let mut stream = mock.complete_stream(&[], &[]).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.text_delta, "a");
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.tool_call.unwrap().name, "search");
        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(third.text_delta, "b");
        assert!(stream.next().await.is_none());
    }
}
