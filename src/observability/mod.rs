//! 可观测性：tracing 初始化与 LLM 调用指标

pub mod metrics;

pub use metrics::{MetricsError, MetricsRecorder, MetricsSnapshot};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局 subscriber：默认 info，可通过 RUST_LOG 覆盖；重复调用时忽略
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
