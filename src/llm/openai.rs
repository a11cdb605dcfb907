//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。
//! complete_stream 为退化实现：一次非流式请求后把正文按固定块长切成增量序列，
//! 工具调用请求附在末尾；真正的增量传输由后端协作方升级时替换。

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionTool, ChatCompletionTools,
    CreateChatCompletionRequestArgs, FunctionObjectArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{ChunkStream, LlmClient, StreamChunk, ToolCallRequest, ToolSpec};
use crate::memory::Message;

/// 流式切块时每块字符数
const CHUNK_CHARS: usize = 6;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            usage: TokenUsage::new(),
        }
    }

    fn to_openai_messages(&self, messages: &[Message]) -> Vec<ChatCompletionRequestMessage> {
        messages
            .iter()
            .map(|m| match m.role {
                crate::memory::Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .unwrap(),
                ),
                crate::memory::Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .unwrap(),
                ),
                crate::memory::Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .unwrap(),
                ),
            })
            .collect()
    }

    fn to_openai_tools(&self, tools: &[ToolSpec]) -> Result<Vec<ChatCompletionTools>, String> {
        tools
            .iter()
            .map(|t| {
                let function = FunctionObjectArgs::default()
                    .name(t.name.clone())
                    .description(t.description.clone())
                    .parameters(t.parameters.clone())
                    .build()
                    .map_err(|e| e.to_string())?;
                Ok(ChatCompletionTools::Function(ChatCompletionTool {
                    function,
                }))
            })
            .collect()
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    fn provider(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.to_openai_messages(messages))
            .build()
            .map_err(|e| e.to_string())?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(content)
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ChunkStream, String> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .messages(self.to_openai_messages(messages));
        if !tools.is_empty() {
            builder.tools(self.to_openai_tools(tools)?);
        }
        let request = builder.build().map_err(|e| e.to_string())?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let choice = response.choices.into_iter().next();
        let content = choice
            .as_ref()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        let mut chunks: Vec<Result<StreamChunk, String>> = Vec::new();
        let chars: Vec<char> = content.chars().collect();
        for chunk in chars.chunks(CHUNK_CHARS) {
            chunks.push(Ok(StreamChunk::text(chunk.iter().collect::<String>())));
        }

        // 通过 JSON 视图提取工具调用，规避 SDK 小版本间的类型差异
        if let Some(tool_calls) = choice.and_then(|c| c.message.tool_calls) {
            if let Ok(serde_json::Value::Array(calls)) = serde_json::to_value(&tool_calls) {
                for call in calls {
                    let name = call["function"]["name"].as_str().unwrap_or_default();
                    if name.is_empty() {
                        continue;
                    }
                    let raw_args = call["function"]["arguments"].as_str().unwrap_or("{}");
                    let arguments =
                        serde_json::from_str(raw_args).unwrap_or(serde_json::Value::Null);
                    chunks.push(Ok(StreamChunk {
                        tool_call: Some(ToolCallRequest {
                            name: name.to_string(),
                            arguments,
                        }),
                        ..StreamChunk::default()
                    }));
                }
            }
        }

        let stream: Pin<Box<dyn futures_util::Stream<Item = Result<StreamChunk, String>> + Send>> =
            Box::pin(stream::iter(chunks));
        Ok(stream)
    }
}
