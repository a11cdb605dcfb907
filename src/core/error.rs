//! 轮次错误类型
//!
//! 按恢复策略分层：Overflow / ModelStream 上抛并终止轮次，
//! Tool 在本地降级（结果回注模型流），TaskState 拒绝后轮次继续。

use thiserror::Error;

/// 会话轮次执行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum TurnError {
    /// NONE 策略下历史超出 token 预算：调用方必须自行决策，不做静默截断
    #[error("Context overflow: {used} tokens exceed budget {budget}")]
    Overflow { used: usize, budget: usize },

    /// 工具调用失败：本地恢复，以工具输出的形式回注模型流
    #[error("Tool invocation failed: {tool}: {reason}")]
    Tool { tool: String, reason: String },

    /// 请求的工具不在能力集内
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// 模型流中途失败：以终止事件上抛，活动任务标记 FAILED
    #[error("Model stream error: {0}")]
    ModelStream(String),

    /// 非法任务状态转移：拒绝并记录日志，轮次继续
    #[error("Invalid task transition: {0}")]
    TaskState(String),

    /// 非流式模型调用失败（Analyzer / 摘要）
    #[error("LLM error: {0}")]
    Llm(String),

    /// 调用方断开或主动取消
    #[error("Cancelled by caller")]
    Cancelled,

    /// 会话上存在未结束的轮次（同会话并发轮次不受支持）
    #[error("Concurrent turn on session {0} rejected")]
    ConcurrentTurn(String),

    #[error("Config error: {0}")]
    Config(String),

    /// 存储协作方返回的错误
    #[error("Store error: {0}")]
    Store(String),
}
