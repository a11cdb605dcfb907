//! 工具层：端点抽象与调用分发

pub mod dispatcher;
pub mod endpoint;

pub use dispatcher::ToolDispatcher;
pub use endpoint::{endpoints_from_urls, HttpToolEndpoint, ToolDefinition, ToolEndpoint};
