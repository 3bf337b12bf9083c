//! 可观测性：日志初始化与性能计数器

pub mod metrics;

pub use metrics::{CountersSnapshot, PerformanceCounters};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化 tracing：默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
