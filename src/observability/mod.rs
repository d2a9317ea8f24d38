//! 可观测性：tracing 初始化
//!
//! 默认级别 info，可通过 RUST_LOG 覆盖。控制循环的结构化事件经 TracingEventSink 写入同一日志流。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    init_with_default("info");
}

/// 以给定默认级别初始化；已初始化时静默返回（测试中可重复调用）
pub fn init_with_default(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
