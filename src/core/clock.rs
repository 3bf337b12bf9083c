//! 单调时钟
//!
//! 以某个起点 Instant 为纪元，返回毫秒偏移；可存入 AtomicU64（熔断恢复时间、决策防抖时间戳）。
//! 使用 tokio::time::Instant，测试中可通过 `start_paused` + `advance` 控制虚拟时间。

use std::time::Duration;

use tokio::time::Instant;

/// 共享单调时钟：克隆后共享同一纪元
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// 自纪元起经过的毫秒数
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// 将毫秒偏移换算回 Instant
    pub fn instant_at(&self, ms: u64) -> Instant {
        self.epoch + Duration::from_millis(ms)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_virtual_time() {
        let clock = MonotonicClock::new();
        assert_eq!(clock.now_ms(), 0);
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.now_ms(), 1500);

        let copy = clock;
        assert_eq!(copy.now_ms(), clock.now_ms());
    }
}
