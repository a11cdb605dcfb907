//! 轮次层：上下文、事件协议与编排器

pub mod events;
pub mod orchestrator;

pub use events::TurnEvent;
pub use orchestrator::{TurnHandle, TurnOrchestrator};

use crate::memory::OverflowStrategy;

/// 编排模式：纯对话或带工具的智能体（配置开关，非类层级）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    /// 直接对话：跳过 Analyzer 与任务机制
    Chat,
    /// 任务执行：Analyzer 门 + 任务拆分 + 工具调用
    Agent,
}

/// 单次轮次的显式上下文：贯穿全部调用传参，不使用任何环境态
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session_id: String,
    pub user_id: String,
    /// 本轮模型上下文 token 预算
    pub budget_tokens: usize,
    pub strategy: OverflowStrategy,
    pub mode: TurnMode,
}
