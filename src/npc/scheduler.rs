//! 分层调度器
//!
//! 一个后台任务驱动三个定时器：
//! - active：附近有观察者的 Agent（上限 max_active_agents）按 batch_size 分批提交到批处理池，做完整更新
//! - inactive：其余 Agent 只做廉价更新（作息 / 状态检查，不调用 AI）
//! - maintenance：清理已移除 Agent 的限流簿记、空闲会话
//!
//! tiering 关闭时每个 active tick 处理全部 Agent（不设上限），inactive tick 不做事。

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::agent::{Agent, AgentRegistry};
use super::executor::DecisionExecutor;
use crate::core::{DecisionLimiter, MonotonicClock, ShutdownCleanup, SubmitOutcome, WorkerPool};
use crate::memory::ConversationStore;

/// 调度参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub tiering: bool,
    pub max_active_agents: usize,
    pub batch_size: usize,
    pub nearby_range: f64,
    pub active_tick_ms: u64,
    pub inactive_tick_ms: u64,
    pub maintenance_interval_ms: u64,
    pub conversation_idle_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tiering: true,
            max_active_agents: 20,
            batch_size: 5,
            nearby_range: 20.0,
            active_tick_ms: 1_000,
            inactive_tick_ms: 5_000,
            maintenance_interval_ms: 300_000,
            conversation_idle_timeout_ms: 600_000,
        }
    }
}

/// 调度统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub total_updates: u64,
    pub batches: u64,
    pub avg_batch_ms: f64,
    pub current_active: usize,
    pub total_agents: usize,
    pub tracked_agents: usize,
    pub dropped_batches: u64,
}

/// 一次维护的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub stale_gates: usize,
    pub idle_conversations: usize,
    pub idle_agent_conversations: usize,
}

/// `id` 是否属于决策会话 `owner`：`npc_{agent}` 本身或 `npc_{agent}_{observer}`
fn owned_by(id: &str, owner: &str) -> bool {
    id.strip_prefix(owner)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('_'))
}

#[derive(Default)]
struct Counters {
    total_updates: AtomicU64,
    batches: AtomicU64,
    batch_ms: AtomicU64,
    current_active: AtomicUsize,
    dropped_batches: AtomicU64,
}

/// 分层调度器
pub struct TieredScheduler {
    agents: Arc<AgentRegistry>,
    executor: Arc<DecisionExecutor>,
    limiter: Arc<DecisionLimiter>,
    store: Arc<ConversationStore>,
    batch_pool: Arc<WorkerPool>,
    clock: MonotonicClock,
    config: SchedulerConfig,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TieredScheduler {
    pub fn new(
        agents: Arc<AgentRegistry>,
        executor: Arc<DecisionExecutor>,
        limiter: Arc<DecisionLimiter>,
        store: Arc<ConversationStore>,
        batch_pool: Arc<WorkerPool>,
        clock: MonotonicClock,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            agents,
            executor,
            limiter,
            store,
            batch_pool,
            clock,
            config,
            counters: Arc::new(Counters::default()),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// 按附近是否有观察者划分 (near, far)
    fn partition(&self) -> (Vec<Arc<Agent>>, Vec<Arc<Agent>>) {
        let world = self.executor.world();
        self.agents
            .all()
            .into_iter()
            .filter(|a| a.is_alive())
            .partition(|a| {
                !world
                    .nearby_observers(a.id(), self.config.nearby_range)
                    .is_empty()
            })
    }

    /// 高频层：返回本 tick 提交处理的 Agent 数
    pub async fn active_tick(&self) -> usize {
        let selected = if self.config.tiering {
            let (mut near, _) = self.partition();
            near.truncate(self.config.max_active_agents);
            near
        } else {
            self.agents.all()
        };
        self.counters
            .current_active
            .store(selected.len(), Ordering::Relaxed);

        let batch_size = self.config.batch_size.max(1);
        let mut submitted = 0;
        for batch in selected.chunks(batch_size) {
            let batch = batch.to_vec();
            let len = batch.len();
            let executor = Arc::clone(&self.executor);
            let counters = Arc::clone(&self.counters);
            let clock = self.clock;
            let job = async move {
                let started = clock.now_ms();
                for agent in &batch {
                    executor.full_update(agent).await;
                }
                counters
                    .batch_ms
                    .fetch_add(clock.now_ms().saturating_sub(started), Ordering::Relaxed);
                counters.batches.fetch_add(1, Ordering::Relaxed);
                counters
                    .total_updates
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
            .boxed();

            match self.batch_pool.submit(job).await {
                SubmitOutcome::Rejected => {
                    self.counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
                }
                // 本批已入队，被挤掉的是更早排队的一批
                SubmitOutcome::DisplacedOldest => {
                    self.counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
                    submitted += len;
                }
                SubmitOutcome::Queued | SubmitOutcome::RanInCaller => submitted += len,
            }
        }
        submitted
    }

    /// 低频层：只做廉价更新，返回处理的 Agent 数
    pub fn inactive_tick(&self) -> usize {
        if !self.config.tiering {
            return 0;
        }
        let (_, far) = self.partition();
        for agent in &far {
            self.executor.cheap_update(agent);
        }
        far.len()
    }

    /// 维护：清理失效簿记与空闲会话
    pub async fn maintenance(&self) -> MaintenanceReport {
        let agents = Arc::clone(&self.agents);
        let stale_gates = self.limiter.retain_live(|id| agents.contains(id));
        let idle_timeout = self.config.conversation_idle_timeout_ms;
        let now = self.clock.now_ms();

        // 只淘汰长时间不活跃的 Agent 名下的会话；玩家聊天等其他会话不归调度器管
        let inactive: Vec<String> = self
            .agents
            .all()
            .iter()
            .filter(|a| now.saturating_sub(a.last_active_ms()) > idle_timeout)
            .map(|a| DecisionExecutor::decision_conversation_id(a.id()))
            .collect();
        let idle_conversations = if inactive.is_empty() {
            0
        } else {
            self.store
                .evict_idle_where(idle_timeout, |id| {
                    inactive.iter().any(|owner| owned_by(id, owner))
                })
                .await
        };

        let idle_agent_conversations = self
            .agents
            .all()
            .iter()
            .map(|a| a.evict_idle_conversations(now, idle_timeout).len())
            .sum();

        let report = MaintenanceReport {
            stale_gates,
            idle_conversations,
            idle_agent_conversations,
        };
        tracing::info!(
            agents = self.agents.len(),
            stale_gates,
            idle_conversations,
            idle_agent_conversations,
            "scheduler maintenance"
        );
        report
    }

    pub fn stats(&self) -> SchedulerStats {
        let batches = self.counters.batches.load(Ordering::Relaxed);
        let batch_ms = self.counters.batch_ms.load(Ordering::Relaxed);
        SchedulerStats {
            total_updates: self.counters.total_updates.load(Ordering::Relaxed),
            batches,
            avg_batch_ms: if batches == 0 {
                0.0
            } else {
                batch_ms as f64 / batches as f64
            },
            current_active: self.counters.current_active.load(Ordering::Relaxed),
            total_agents: self.agents.len(),
            tracked_agents: self.limiter.tracked(),
            dropped_batches: self.counters.dropped_batches.load(Ordering::Relaxed),
        }
    }

    /// 启动定时器循环（须在 runtime 内调用；重复调用无效）
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        if handle.is_some() || self.cancel.is_cancelled() {
            return;
        }
        let scheduler = Arc::clone(self);
        *handle = Some(tokio::spawn(async move { scheduler.run().await }));
        tracing::info!(
            tiering = self.config.tiering,
            active_ms = self.config.active_tick_ms,
            inactive_ms = self.config.inactive_tick_ms,
            "npc scheduler started"
        );
    }

    async fn run(&self) {
        let mut active = ticker(self.config.active_tick_ms);
        let mut inactive = ticker(self.config.inactive_tick_ms);
        let mut maintenance = ticker(self.config.maintenance_interval_ms);
        // interval 的首个 tick 立即完成，维护没必要在启动时就跑
        maintenance.reset();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = active.tick() => {
                    self.active_tick().await;
                }
                _ = inactive.tick() => {
                    self.inactive_tick();
                }
                _ = maintenance.tick() => {
                    self.maintenance().await;
                }
            }
        }
        tracing::debug!("npc scheduler loop exited");
    }

    /// 停止定时器并排空两个工作池
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        self.batch_pool.shutdown().await;
        self.executor.ai_pool().shutdown().await;
        tracing::info!("npc scheduler stopped");
    }
}

fn ticker(period_ms: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_millis(period_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

#[async_trait]
impl ShutdownCleanup for TieredScheduler {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.stop().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "npc-scheduler"
    }
}
