//! Hive - Rust 智能体会话轮次引擎
//!
//! 模块划分：
//! - **analyzer**: 意图/完备性门（轮次前置的一次廉价模型调用）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 消息定义、token 估算、上下文窗口、持久化契约
//! - **task**: 任务记录、聚合视图与生命周期引擎
//! - **tools**: 工具端点抽象与调用分发
//! - **turn**: 轮次上下文、投递事件协议与编排器

pub mod analyzer;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod task;
pub mod tools;
pub mod turn;

pub use crate::core::TurnError;
pub use crate::turn::{TurnContext, TurnEvent, TurnMode, TurnOrchestrator};
