//! 优雅关闭
//!
//! Ctrl+C / SIGTERM / 致命错误经同一个 CancellationToken 通知调度循环、宿主循环和工作池；
//! 之后 ShutdownCoordinator 按注册顺序执行清理钩子（停止调度、清空会话），每个钩子有独立超时。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 控制台退出或 Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号：第一次触发的原因被保留
#[derive(Debug, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 子任务用的取消 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复调用不会覆盖最初的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_none() {
                tracing::info!(?reason, "shutdown requested");
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// 监听 Ctrl+C 与 SIGTERM
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = manager.token.cancelled() => {}
                res = tokio::signal::ctrl_c() => {
                    if res.is_ok() {
                        manager.shutdown(ShutdownReason::UserInitiated);
                    }
                }
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                    tracing::warn!("SIGTERM handler unavailable");
                    return;
                };
                tokio::select! {
                    _ = manager.token.cancelled() => {}
                    _ = sigterm.recv() => manager.shutdown(ShutdownReason::Signal),
                }
            });
        }
    }
}

/// 关闭阶段的清理钩子
#[async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 清理结果汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub completed: Vec<&'static str>,
    pub failed: Vec<&'static str>,
    pub timed_out: Vec<&'static str>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

/// 按注册顺序执行清理钩子
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    hooks: Vec<Arc<dyn ShutdownCleanup>>,
    hook_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            hooks: Vec::new(),
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
        }
    }

    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, hook: T) {
        self.hooks.push(Arc::new(hook));
    }

    pub fn register_shared(&mut self, hook: Arc<dyn ShutdownCleanup>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }

    /// 单个钩子失败或超时不影响后续钩子
    pub async fn run_cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for hook in &self.hooks {
            let name = hook.name();
            match tokio::time::timeout(self.hook_timeout, hook.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::debug!(hook = name, "cleanup done");
                    report.completed.push(name);
                }
                Ok(Err(e)) => {
                    tracing::warn!(hook = name, error = %e, "cleanup failed");
                    report.failed.push(name);
                }
                Err(_) => {
                    tracing::warn!(
                        hook = name,
                        timeout_ms = self.hook_timeout.as_millis() as u64,
                        "cleanup timed out"
                    );
                    report.timed_out.push(name);
                }
            }
        }
        tracing::info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            timed_out = report.timed_out.len(),
            "shutdown cleanup finished"
        );
        report
    }
}

/// 运行 app 直到其结束或收到关闭信号，然后执行 cleanup
pub async fn run_with_graceful_shutdown<A, C, Fut>(
    manager: Arc<ShutdownManager>,
    app: A,
    cleanup: C,
) -> CleanupReport
where
    A: Future<Output = ()>,
    C: FnOnce() -> Fut,
    Fut: Future<Output = CleanupReport>,
{
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => manager.shutdown(ShutdownReason::UserInitiated),
        _ = manager.wait() => {}
    }

    cleanup().await
}
