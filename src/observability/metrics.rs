//! 性能计数器
//!
//! 单调递增的请求总数 / 失败数 / 丢弃数，以及成功请求的平均延迟。
//! 由调度器与限流器写入，管理面只读；全部使用原子操作，无锁。

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// 读多写少的全局计数器
#[derive(Debug, Default)]
pub struct PerformanceCounters {
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    dropped_requests: AtomicU64,
    successful_requests: AtomicU64,
    total_latency_ms: AtomicU64,
}

/// 计数器快照（管理面展示用）
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CountersSnapshot {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub dropped_requests: u64,
    pub avg_latency_ms: u64,
}

impl PerformanceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// 一次对外调度开始
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// 一次调度最终成功，记录端到端延迟
    pub fn record_success(&self, latency_ms: u64) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    /// 一次调度在重试耗尽后失败
    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// 因许可池满 / 队列溢出而被跳过的工作项
    pub fn record_dropped(&self) {
        self.dropped_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_latency_ms(&self) -> u64 {
        let n = self.successful_requests.load(Ordering::Relaxed);
        if n == 0 {
            return 0;
        }
        self.total_latency_ms.load(Ordering::Relaxed) / n
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            dropped_requests: self.dropped_requests.load(Ordering::Relaxed),
            avg_latency_ms: self.avg_latency_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let c = PerformanceCounters::new();
        c.record_request();
        c.record_request();
        c.record_request();
        c.record_success(100);
        c.record_success(300);
        c.record_failure();
        c.record_dropped();

        let s = c.snapshot();
        assert_eq!(s.total_requests, 3);
        assert_eq!(s.failed_requests, 1);
        assert_eq!(s.dropped_requests, 1);
        assert_eq!(s.avg_latency_ms, 200);
    }

    #[test]
    fn test_avg_latency_without_successes() {
        let c = PerformanceCounters::new();
        c.record_request();
        c.record_failure();
        assert_eq!(c.avg_latency_ms(), 0);
    }
}
