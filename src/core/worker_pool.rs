//! 有界工作池
//!
//! 固定数量的 worker task 从有界队列取任务执行。队列满时的处理由 OverflowPolicy 决定：
//! - RunInCaller：在提交方直接执行，保证进度（Agent 批处理，丢任务不可接受）
//! - DropOldest：丢弃最旧的排队任务（AI 调用，过期决策没有价值）

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::observability::PerformanceCounters;

/// 排队任务
pub type Job = BoxFuture<'static, ()>;

/// 队列满时的策略
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    RunInCaller,
    DropOldest,
}

/// 提交结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// 队列已满，任务已在调用方执行完毕
    RanInCaller,
    /// 队列已满，最旧的排队任务被丢弃后入队
    DisplacedOldest,
    /// 池已关闭，任务被丢弃
    Rejected,
}

struct Shared {
    name: &'static str,
    queue: Mutex<VecDeque<Job>>,
    capacity: usize,
    notify: Notify,
    cancel: CancellationToken,
    dropped: AtomicU64,
    counters: Arc<PerformanceCounters>,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pop(&self) -> Option<Job> {
        self.queue().pop_front()
    }
}

/// 有界工作池
pub struct WorkerPool {
    shared: Arc<Shared>,
    policy: OverflowPolicy,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// 创建并启动 worker；必须在 tokio runtime 内调用
    pub fn new(
        name: &'static str,
        workers: usize,
        capacity: usize,
        policy: OverflowPolicy,
        counters: Arc<PerformanceCounters>,
    ) -> Self {
        let shared = Arc::new(Shared {
            name,
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            dropped: AtomicU64::new(0),
            counters,
        });

        let handles = (0..workers.max(1))
            .map(|_| tokio::spawn(worker_loop(Arc::clone(&shared))))
            .collect();

        Self {
            shared,
            policy,
            workers: Mutex::new(handles),
        }
    }

    /// 提交任务
    pub async fn submit(&self, job: Job) -> SubmitOutcome {
        if self.shared.cancel.is_cancelled() {
            return SubmitOutcome::Rejected;
        }

        // 锁内只做入队决策，RunInCaller 的任务在释放锁后执行
        let (outcome, overflow) = {
            let mut queue = self.shared.queue();
            if queue.len() < self.shared.capacity {
                queue.push_back(job);
                (SubmitOutcome::Queued, None)
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(job);
                        (SubmitOutcome::DisplacedOldest, None)
                    }
                    OverflowPolicy::RunInCaller => (SubmitOutcome::RanInCaller, Some(job)),
                }
            }
        };

        if let Some(job) = overflow {
            tracing::debug!(pool = self.shared.name, "queue full, running in caller");
            job.await;
            return outcome;
        }

        if outcome == SubmitOutcome::DisplacedOldest {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            self.shared.counters.record_dropped();
            tracing::debug!(pool = self.shared.name, "queue full, dropped oldest job");
        }
        self.shared.notify.notify_one();
        outcome
    }

    /// 当前排队数
    pub fn queued(&self) -> usize {
        self.shared.queue().len()
    }

    /// 因溢出被丢弃的任务数
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// 停止接收新任务，丢弃排队任务并等待 worker 退出（正在执行的任务会先完成）
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let discarded = {
            let mut queue = self.shared.queue();
            let n = queue.len();
            queue.clear();
            n
        };
        let handles: Vec<_> = {
            let mut workers = self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        tracing::debug!(pool = self.shared.name, discarded, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn worker_loop(shared: Arc<Shared>) {
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        if let Some(job) = shared.pop() {
            job.await;
            continue;
        }
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = shared.notify.notified() => {}
        }
    }
}
