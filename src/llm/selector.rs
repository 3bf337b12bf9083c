//! 端点选择策略
//!
//! - Single：第一个可用端点
//! - WeightedRandom：按权重累积分布抽样
//! - Failover：轮转游标，跳过熔断中的端点
//!
//! 过滤后为空时执行 fail-open：记录 exhausted 事件并告警，重置全部端点后再过滤一次。

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use super::endpoint::{Endpoint, EndpointRegistry};
use crate::core::ConfigError;

/// 选择策略
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    Single,
    #[default]
    WeightedRandom,
    Failover,
}

impl FromStr for SelectionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "single" => Ok(Self::Single),
            "weighted_random" | "weighted" | "random" => Ok(Self::WeightedRandom),
            "failover" | "round_robin" => Ok(Self::Failover),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

/// 端点选择器
pub struct EndpointSelector {
    registry: Arc<EndpointRegistry>,
    policy: SelectionPolicy,
    cursor: AtomicUsize,
    rng: Mutex<SmallRng>,
}

impl EndpointSelector {
    pub fn new(registry: Arc<EndpointRegistry>, policy: SelectionPolicy) -> Self {
        Self {
            registry,
            policy,
            cursor: AtomicUsize::new(0),
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// 用内部随机源选择
    pub fn select(&self) -> Option<Arc<Endpoint>> {
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        self.select_with(&mut *rng)
    }

    /// 用指定随机源选择（测试可注入固定种子）
    pub fn select_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Arc<Endpoint>> {
        let mut candidates = self.registry.selectable();
        if candidates.is_empty() {
            if self.registry.is_empty() {
                return None;
            }
            let events = self.registry.record_exhausted();
            tracing::warn!(
                exhausted_events = events,
                "all endpoints are disabled, resetting circuit state (fail-open)"
            );
            self.registry.reset_all();
            candidates = self.registry.selectable();
            if candidates.is_empty() {
                return None;
            }
        }

        let chosen = match self.policy {
            SelectionPolicy::Single => Arc::clone(&candidates[0]),
            SelectionPolicy::WeightedRandom => pick_weighted(&candidates, rng),
            SelectionPolicy::Failover => {
                let next = self.cursor.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
                Arc::clone(&candidates[next % candidates.len()])
            }
        };
        Some(chosen)
    }
}

/// 累积权重抽样；总权重为 0 时返回第一个
fn pick_weighted<R: Rng + ?Sized>(candidates: &[Arc<Endpoint>], rng: &mut R) -> Arc<Endpoint> {
    let total: f64 = candidates.iter().map(|e| e.weight()).sum();
    if total <= 0.0 {
        return Arc::clone(&candidates[0]);
    }
    let draw = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    for endpoint in candidates {
        cumulative += endpoint.weight();
        if cumulative > draw {
            return Arc::clone(endpoint);
        }
    }
    // 浮点累加误差兜底
    Arc::clone(&candidates[candidates.len() - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MonotonicClock;
    use crate::llm::endpoint::EndpointSpec;
    use crate::llm::MockLlmClient;
    use rand::rngs::StdRng;
    use std::collections::HashMap;

    fn registry(weights: &[(&str, f64)]) -> Arc<EndpointRegistry> {
        let endpoints = weights
            .iter()
            .map(|(id, w)| {
                let spec = EndpointSpec::new(*id, "m")
                    .with_weight(*w)
                    .with_failure_threshold(1)
                    .with_recovery_window_ms(60_000);
                Arc::new(Endpoint::new(spec, Arc::new(MockLlmClient::new())).unwrap())
            })
            .collect();
        Arc::new(EndpointRegistry::new(endpoints, MonotonicClock::new()))
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("single".parse::<SelectionPolicy>(), Ok(SelectionPolicy::Single));
        assert_eq!(
            "Weighted-Random".parse::<SelectionPolicy>(),
            Ok(SelectionPolicy::WeightedRandom)
        );
        assert_eq!("failover".parse::<SelectionPolicy>(), Ok(SelectionPolicy::Failover));
        assert!("fastest".parse::<SelectionPolicy>().is_err());
    }

    #[test]
    fn test_weighted_distribution() {
        let selector = EndpointSelector::new(
            registry(&[("a", 5.0), ("b", 3.0), ("c", 2.0)]),
            SelectionPolicy::WeightedRandom,
        );
        let mut rng = StdRng::seed_from_u64(42);
        let mut hits: HashMap<String, usize> = HashMap::new();
        for _ in 0..1000 {
            let ep = selector.select_with(&mut rng).unwrap();
            *hits.entry(ep.id().to_string()).or_default() += 1;
        }
        let ratio = |id: &str| hits.get(id).copied().unwrap_or(0) as f64 / 1000.0;
        assert!((ratio("a") - 0.5).abs() < 0.05, "a = {}", ratio("a"));
        assert!((ratio("b") - 0.3).abs() < 0.05, "b = {}", ratio("b"));
        assert!((ratio("c") - 0.2).abs() < 0.05, "c = {}", ratio("c"));
    }

    #[test]
    fn test_zero_total_weight_returns_first() {
        let selector = EndpointSelector::new(
            registry(&[("a", 0.0), ("b", 0.0)]),
            SelectionPolicy::WeightedRandom,
        );
        for _ in 0..10 {
            assert_eq!(selector.select().unwrap().id(), "a");
        }
    }

    #[test]
    fn test_failover_rotates_and_skips_disabled() {
        let reg = registry(&[("a", 1.0), ("b", 1.0), ("c", 1.0)]);
        let selector = EndpointSelector::new(Arc::clone(&reg), SelectionPolicy::Failover);
        let seq: Vec<_> = (0..3)
            .map(|_| selector.select().unwrap().id().to_string())
            .collect();
        assert_eq!(seq, vec!["b", "c", "a"]);

        let b = reg.get("b").unwrap();
        reg.report_failure(&b);
        for _ in 0..6 {
            assert_ne!(selector.select().unwrap().id(), "b");
        }
    }

    #[test]
    fn test_single_returns_first_healthy() {
        let reg = registry(&[("a", 1.0), ("b", 1.0)]);
        let selector = EndpointSelector::new(Arc::clone(&reg), SelectionPolicy::Single);
        assert_eq!(selector.select().unwrap().id(), "a");
        reg.report_failure(&reg.get("a").unwrap());
        assert_eq!(selector.select().unwrap().id(), "b");
    }

    #[test]
    fn test_fail_open_resets_and_counts() {
        let reg = registry(&[("a", 1.0), ("b", 1.0)]);
        let selector = EndpointSelector::new(Arc::clone(&reg), SelectionPolicy::Single);
        for ep in reg.endpoints().iter() {
            reg.report_failure(ep);
        }
        assert!(reg.selectable().is_empty());

        assert_eq!(selector.select().unwrap().id(), "a");
        assert_eq!(reg.exhausted_events(), 1);
        assert_eq!(reg.selectable().len(), 2);
    }

    #[test]
    fn test_empty_registry_returns_none() {
        let selector = EndpointSelector::new(registry(&[]), SelectionPolicy::Failover);
        assert!(selector.select().is_none());
        assert_eq!(selector.registry().exhausted_events(), 0);
    }
}
