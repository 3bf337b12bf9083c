//! 端点注册表 + 熔断器
//!
//! 每个端点持有自己的后端客户端与健康状态（连续失败次数、禁用截止时间）。
//! 健康字段全部是原子量，选择器与调度器并发读写无需加锁；注册表整体只在 reload 时替换。
//!
//! 熔断规则：连续失败达到阈值即设置 `disabled_until = now + recovery_window`；
//! 恢复只看时间。恢复后失败计数不清零，首个失败会立即再次熔断，成功一次才完全闭合。

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use super::LlmClient;
use crate::core::{ConfigError, MonotonicClock};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_WINDOW_MS: u64 = 300_000;

/// 端点静态参数
#[derive(Clone, Debug, PartialEq)]
pub struct EndpointSpec {
    pub id: String,
    pub model: String,
    pub weight: f64,
    pub failure_threshold: u32,
    pub recovery_window_ms: u64,
}

impl EndpointSpec {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            weight: 1.0,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_window_ms: DEFAULT_RECOVERY_WINDOW_MS,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_window_ms(mut self, ms: u64) -> Self {
        self.recovery_window_ms = ms;
        self
    }

    /// 配置校验：失败只影响该端点本身
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::MissingModel(self.id.clone()));
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(ConfigError::InvalidWeight {
                endpoint: self.id.clone(),
                weight: self.weight,
            });
        }
        Ok(())
    }
}

/// 已注册的端点
pub struct Endpoint {
    spec: EndpointSpec,
    client: Arc<dyn LlmClient>,
    consecutive_failures: AtomicU32,
    /// 单调毫秒；0 表示从未熔断
    disabled_until_ms: AtomicU64,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.spec.id)
            .field("weight", &self.spec.weight)
            .field("failures", &self.failures())
            .field("disabled_until_ms", &self.disabled_until_ms())
            .finish()
    }
}

impl Endpoint {
    pub fn new(spec: EndpointSpec, client: Arc<dyn LlmClient>) -> Result<Self, ConfigError> {
        spec.validate()?;
        Ok(Self {
            spec: EndpointSpec {
                failure_threshold: spec.failure_threshold.max(1),
                ..spec
            },
            client,
            consecutive_failures: AtomicU32::new(0),
            disabled_until_ms: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn model(&self) -> &str {
        &self.spec.model
    }

    pub fn weight(&self) -> f64 {
        self.spec.weight
    }

    pub fn spec(&self) -> &EndpointSpec {
        &self.spec
    }

    pub fn client(&self) -> &Arc<dyn LlmClient> {
        &self.client
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn disabled_until_ms(&self) -> u64 {
        self.disabled_until_ms.load(Ordering::Acquire)
    }

    /// 可选当且仅当 now >= disabled_until
    pub fn is_selectable(&self, now_ms: u64) -> bool {
        now_ms >= self.disabled_until_ms()
    }

    /// 记一次失败；返回本次是否触发熔断
    pub fn report_failure(&self, now_ms: u64) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.spec.failure_threshold {
            self.disabled_until_ms
                .store(now_ms + self.spec.recovery_window_ms, Ordering::Release);
            tracing::warn!(
                endpoint = %self.spec.id,
                failures,
                recovery_ms = self.spec.recovery_window_ms,
                "circuit opened"
            );
            return true;
        }
        false
    }

    /// 成功一次即完全闭合
    pub fn report_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.disabled_until_ms.store(0, Ordering::Release);
    }

    pub fn reset(&self) {
        self.report_success();
    }

    fn health(&self, now_ms: u64) -> EndpointHealth {
        EndpointHealth {
            id: self.spec.id.clone(),
            model: self.spec.model.clone(),
            weight: self.spec.weight,
            consecutive_failures: self.failures(),
            disabled_for_ms: self.disabled_until_ms().saturating_sub(now_ms),
            selectable: self.is_selectable(now_ms),
        }
    }
}

/// 管理面：单个端点健康快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointHealth {
    pub id: String,
    pub model: String,
    pub weight: f64,
    pub consecutive_failures: u32,
    pub disabled_for_ms: u64,
    pub selectable: bool,
}

/// 管理面：注册表健康快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryHealth {
    pub endpoints: Vec<EndpointHealth>,
    /// 全部端点不可用而触发 fail-open 的次数
    pub exhausted_events: u64,
    /// 没有任何可用端点配置（降级运行）
    pub degraded: bool,
}

/// 端点注册表
pub struct EndpointRegistry {
    endpoints: RwLock<Arc<Vec<Arc<Endpoint>>>>,
    clock: MonotonicClock,
    exhausted_events: AtomicU64,
}

impl EndpointRegistry {
    pub fn new(endpoints: Vec<Arc<Endpoint>>, clock: MonotonicClock) -> Self {
        if endpoints.is_empty() {
            tracing::warn!("no usable LLM endpoints configured; running degraded");
        }
        Self {
            endpoints: RwLock::new(Arc::new(endpoints)),
            clock,
            exhausted_events: AtomicU64::new(0),
        }
    }

    /// 当前端点列表（配置顺序）
    pub fn endpoints(&self) -> Arc<Vec<Arc<Endpoint>>> {
        match self.endpoints.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// 整体替换（reload）：新端点健康状态为初始值
    pub fn replace(&self, endpoints: Vec<Arc<Endpoint>>) {
        let count = endpoints.len();
        let next = Arc::new(endpoints);
        match self.endpoints.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        tracing::info!(count, "endpoint registry reloaded");
    }

    pub fn get(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints().iter().find(|e| e.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.endpoints().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints().is_empty()
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// 当前可选端点（保持配置顺序）
    pub fn selectable(&self) -> Vec<Arc<Endpoint>> {
        let now = self.clock.now_ms();
        self.endpoints()
            .iter()
            .filter(|e| e.is_selectable(now))
            .cloned()
            .collect()
    }

    pub fn report_failure(&self, endpoint: &Endpoint) -> bool {
        endpoint.report_failure(self.clock.now_ms())
    }

    pub fn report_success(&self, endpoint: &Endpoint) {
        endpoint.report_success();
    }

    /// 管理面强制重置全部端点
    pub fn reset_all(&self) {
        for endpoint in self.endpoints().iter() {
            endpoint.reset();
        }
    }

    pub(crate) fn record_exhausted(&self) -> u64 {
        self.exhausted_events.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn exhausted_events(&self) -> u64 {
        self.exhausted_events.load(Ordering::Relaxed)
    }

    pub fn health(&self) -> RegistryHealth {
        let now = self.clock.now_ms();
        let endpoints: Vec<_> = self.endpoints().iter().map(|e| e.health(now)).collect();
        RegistryHealth {
            degraded: endpoints.is_empty(),
            endpoints,
            exhausted_events: self.exhausted_events(),
        }
    }
}
