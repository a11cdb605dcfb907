//! 记忆层：消息定义、token 估算、上下文窗口构建、持久化契约

pub mod context_window;
pub mod message;
pub mod persistence;
pub mod token_budget;

pub use context_window::{ContextWindow, ContextWindowManager, OverflowStrategy, SummarizeConfig};
pub use message::{Message, MessageKind, Role};
pub use persistence::{InMemorySessionStore, InMemoryTaskStore, SessionStore, TaskStore};
pub use token_budget::TokenEstimator;
