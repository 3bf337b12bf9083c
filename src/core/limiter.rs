//! 决策并发限制：全局许可池 + 单 Agent 互斥/防抖
//!
//! 准入顺序：防抖（未到决策间隔直接返回）-> 单 Agent processing 标志 CAS -> 全局 Semaphore try_acquire。
//! 许可池满时立即返回 Saturated，调用方跳过该工作项，下个调度周期再试，绝不阻塞调度线程。
//! DecisionTicket 持有许可并在 Drop 时清除 processing 标志，无论结果成功、失败还是被丢弃。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::MonotonicClock;
use crate::observability::PerformanceCounters;

/// 单个 Agent 的调度簿记
#[derive(Debug)]
struct AgentGate {
    processing: AtomicBool,
    last_decision_ms: AtomicU64,
}

impl AgentGate {
    fn new(now_ms: u64) -> Self {
        Self {
            processing: AtomicBool::new(false),
            last_decision_ms: AtomicU64::new(now_ms),
        }
    }
}

/// 准入结果
#[derive(Debug)]
pub enum Admission {
    /// 获准发起决策；持有 ticket 直到结果被完整应用
    Granted(DecisionTicket),
    /// 距上次决策不足 decision_interval
    NotDue { remaining_ms: u64 },
    /// 该 Agent 已有决策在途
    Busy,
    /// 全局许可池已满，本周期跳过
    Saturated,
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// 在途决策凭证：持有全局许可，Drop 时释放许可并清除该 Agent 的 processing 标志
#[derive(Debug)]
pub struct DecisionTicket {
    agent_id: String,
    gate: Arc<AgentGate>,
    _permit: OwnedSemaphorePermit,
}

impl DecisionTicket {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

impl Drop for DecisionTicket {
    fn drop(&mut self) {
        self.gate.processing.store(false, Ordering::Release);
    }
}

/// 决策并发限制器
pub struct DecisionLimiter {
    permits: Arc<Semaphore>,
    max_permits: usize,
    gates: Mutex<HashMap<String, Arc<AgentGate>>>,
    clock: MonotonicClock,
    counters: Arc<PerformanceCounters>,
}

impl DecisionLimiter {
    pub fn new(
        max_concurrent: usize,
        clock: MonotonicClock,
        counters: Arc<PerformanceCounters>,
    ) -> Self {
        let max_permits = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_permits)),
            max_permits,
            gates: Mutex::new(HashMap::new()),
            clock,
            counters,
        }
    }

    fn gates(&self) -> MutexGuard<'_, HashMap<String, Arc<AgentGate>>> {
        // 临界区内只有 HashMap 操作，不会在持锁时 panic
        self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gate(&self, agent_id: &str) -> Arc<AgentGate> {
        let now = self.clock.now_ms();
        self.gates()
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(AgentGate::new(now)))
            .clone()
    }

    /// 登记 Agent：防抖计时从此刻开始
    pub fn register(&self, agent_id: &str) {
        let now = self.clock.now_ms();
        self.gates()
            .insert(agent_id.to_string(), Arc::new(AgentGate::new(now)));
    }

    /// 尝试为 Agent 发起一次决策（非阻塞）
    pub fn try_admit(&self, agent_id: &str, decision_interval_ms: u64) -> Admission {
        let gate = self.gate(agent_id);
        let now = self.clock.now_ms();

        let elapsed = now.saturating_sub(gate.last_decision_ms.load(Ordering::Acquire));
        if elapsed < decision_interval_ms {
            return Admission::NotDue {
                remaining_ms: decision_interval_ms - elapsed,
            };
        }

        if gate
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Admission::Busy;
        }

        // 另一个刚结束的决策可能在 CAS 前更新了时间戳
        let elapsed = now.saturating_sub(gate.last_decision_ms.load(Ordering::Acquire));
        if elapsed < decision_interval_ms {
            gate.processing.store(false, Ordering::Release);
            return Admission::NotDue {
                remaining_ms: decision_interval_ms - elapsed,
            };
        }

        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                gate.last_decision_ms.store(now, Ordering::Release);
                Admission::Granted(DecisionTicket {
                    agent_id: agent_id.to_string(),
                    gate,
                    _permit: permit,
                })
            }
            Err(_) => {
                gate.processing.store(false, Ordering::Release);
                self.counters.record_dropped();
                tracing::debug!(agent_id, "AI permit pool exhausted, skipping decision");
                Admission::Saturated
            }
        }
    }

    /// 当前在途的决策数
    pub fn in_flight(&self) -> usize {
        self.max_permits - self.permits.available_permits()
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    pub fn is_processing(&self, agent_id: &str) -> bool {
        self.gates()
            .get(agent_id)
            .map(|g| g.processing.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// 移除 Agent 簿记（despawn 时调用）
    pub fn remove(&self, agent_id: &str) {
        self.gates().remove(agent_id);
    }

    /// 只保留仍存活的 Agent，返回清理数量
    pub fn retain_live<F>(&self, is_live: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut gates = self.gates();
        let before = gates.len();
        gates.retain(|id, _| is_live(id));
        before - gates.len()
    }

    /// 被跟踪的 Agent 数
    pub fn tracked(&self) -> usize {
        self.gates().len()
    }
}
