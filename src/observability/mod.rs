//! 可观测性

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化 tracing 订阅者；RUST_LOG 可覆盖默认级别
pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("hive=info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}
