//! 消息定义
//!
//! 会话内消息按创建时间全序；该顺序同时是持久化顺序与投递顺序，两者不得分叉。
//! 消息一经创建不可变。

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    System,
    Assistant,
}

/// 消息类别标签：普通文本、工具调用、任务指令
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// 普通文本
    Text,
    /// 模型请求调用工具
    ToolCall,
    /// 任务开始执行
    TaskExec,
    /// 子任务进入执行中
    TaskStatusToLoading,
    /// 子任务完成
    TaskStatusToFinish,
    /// 拆分出一个子任务
    TaskSplit,
    /// 拆分结束
    TaskSplitFinish,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// 创建时间（毫秒时间戳），会话内全序的依据
    pub created_at: i64,
    /// 产生该消息的模型/后端标识；用户消息为 None
    pub provider: Option<String>,
    pub kind: MessageKind,
}

impl Message {
    fn build(role: Role, content: String, kind: MessageKind) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4()),
            role,
            content,
            created_at: Utc::now().timestamp_millis(),
            provider: None,
            kind,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::build(Role::User, content.into(), MessageKind::Text)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::build(Role::System, content.into(), MessageKind::Text)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::build(Role::Assistant, content.into(), MessageKind::Text)
    }

    /// 指定类别标签（任务指令、工具调用等由编排器写入）
    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// 标记产生该消息的模型/后端
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// 是否为应当进入模型上下文的消息（任务状态类指令不进上下文）
    pub fn is_model_visible(&self) -> bool {
        matches!(self.kind, MessageKind::Text | MessageKind::ToolCall)
    }
}
