//! 行为参数（每类 Agent 一份，创建后不可变）
//!
//! 通过 builder 构造；替换配置意味着替换 Arc 引用，而不是原地修改。

use std::collections::BTreeMap;

/// 世界时间（tick，0..24000）中的夜晚区间
pub const NIGHT_START: u64 = 13_000;
pub const NIGHT_END: u64 = 23_000;
pub const DAY_LENGTH: u64 = 24_000;

pub fn is_night(world_time: u64) -> bool {
    (NIGHT_START..=NIGHT_END).contains(&(world_time % DAY_LENGTH))
}

/// 提示词里的时间描述
pub fn time_of_day_label(world_time: u64) -> &'static str {
    match world_time % DAY_LENGTH {
        0..=5_999 => "morning",
        6_000..=11_999 => "noon",
        12_000..=17_999 => "afternoon",
        _ => "night",
    }
}

/// 行为参数
#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorConfig {
    pub wander_radius: f64,
    pub interaction_range: f64,
    pub movement_speed: f64,
    pub decision_interval_ms: u64,
    pub max_conversation_history: usize,
    pub follow_distance: f64,
    pub max_follow_time_ms: u64,
    pub active_at_day: bool,
    pub active_at_night: bool,
    pub sleep_at_night: bool,
    pub aggressive: bool,
    pub invulnerable: bool,
    pub can_follow: bool,
    pub behavior_weights: BTreeMap<String, f64>,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            wander_radius: 20.0,
            interaction_range: 5.0,
            movement_speed: 0.3,
            decision_interval_ms: 3_000,
            max_conversation_history: 10,
            follow_distance: 3.0,
            max_follow_time_ms: 300_000,
            active_at_day: true,
            active_at_night: true,
            sleep_at_night: false,
            aggressive: false,
            invulnerable: false,
            can_follow: true,
            behavior_weights: BTreeMap::new(),
        }
    }
}

impl BehaviorConfig {
    pub fn builder() -> BehaviorConfigBuilder {
        BehaviorConfigBuilder::default()
    }

    /// 在给定世界时间是否应处于活动状态
    pub fn should_be_active_at(&self, world_time: u64) -> bool {
        if is_night(world_time) {
            self.active_at_night && !self.sleep_at_night
        } else {
            self.active_at_day
        }
    }

    /// 行为偏好权重，未配置为 1.0
    pub fn weight(&self, behavior: &str) -> f64 {
        self.behavior_weights
            .get(&behavior.to_ascii_lowercase())
            .copied()
            .unwrap_or(1.0)
    }
}

/// BehaviorConfig 构造器
#[derive(Debug, Clone, Default)]
pub struct BehaviorConfigBuilder {
    config: BehaviorConfig,
}

impl BehaviorConfigBuilder {
    pub fn wander_radius(mut self, radius: f64) -> Self {
        self.config.wander_radius = radius.max(0.0);
        self
    }

    pub fn interaction_range(mut self, range: f64) -> Self {
        self.config.interaction_range = range.max(0.0);
        self
    }

    pub fn movement_speed(mut self, speed: f64) -> Self {
        self.config.movement_speed = speed.max(0.0);
        self
    }

    pub fn decision_interval_ms(mut self, ms: u64) -> Self {
        self.config.decision_interval_ms = ms;
        self
    }

    pub fn max_conversation_history(mut self, turns: usize) -> Self {
        self.config.max_conversation_history = turns.max(1);
        self
    }

    pub fn follow_distance(mut self, distance: f64) -> Self {
        self.config.follow_distance = distance.max(0.0);
        self
    }

    pub fn max_follow_time_ms(mut self, ms: u64) -> Self {
        self.config.max_follow_time_ms = ms;
        self
    }

    pub fn active_at_day(mut self, active: bool) -> Self {
        self.config.active_at_day = active;
        self
    }

    pub fn active_at_night(mut self, active: bool) -> Self {
        self.config.active_at_night = active;
        self
    }

    pub fn sleep_at_night(mut self, sleep: bool) -> Self {
        self.config.sleep_at_night = sleep;
        self
    }

    pub fn aggressive(mut self, aggressive: bool) -> Self {
        self.config.aggressive = aggressive;
        self
    }

    pub fn invulnerable(mut self, invulnerable: bool) -> Self {
        self.config.invulnerable = invulnerable;
        self
    }

    pub fn can_follow(mut self, can_follow: bool) -> Self {
        self.config.can_follow = can_follow;
        self
    }

    pub fn behavior_weight(mut self, behavior: &str, weight: f64) -> Self {
        self.config
            .behavior_weights
            .insert(behavior.to_ascii_lowercase(), weight);
        self
    }

    pub fn build(self) -> BehaviorConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = BehaviorConfig::default();
        assert_eq!(cfg.wander_radius, 20.0);
        assert_eq!(cfg.decision_interval_ms, 3_000);
        assert_eq!(cfg.max_conversation_history, 10);
        assert_eq!(cfg.weight("wander"), 1.0);
    }

    #[test]
    fn test_builder() {
        let cfg = BehaviorConfig::builder()
            .wander_radius(8.0)
            .decision_interval_ms(500)
            .max_conversation_history(0)
            .behavior_weight("Follow", 1.5)
            .build();
        assert_eq!(cfg.wander_radius, 8.0);
        assert_eq!(cfg.decision_interval_ms, 500);
        assert_eq!(cfg.max_conversation_history, 1);
        assert_eq!(cfg.weight("follow"), 1.5);
    }

    #[test]
    fn test_active_windows() {
        let day_only = BehaviorConfig::builder().active_at_night(false).build();
        assert!(day_only.should_be_active_at(1_000));
        assert!(!day_only.should_be_active_at(13_000));
        assert!(!day_only.should_be_active_at(23_000));
        assert!(day_only.should_be_active_at(23_001));

        let sleeper = BehaviorConfig::builder().sleep_at_night(true).build();
        assert!(!sleeper.should_be_active_at(18_000));

        let nocturnal = BehaviorConfig::builder().active_at_day(false).build();
        assert!(!nocturnal.should_be_active_at(6_000));
        assert!(nocturnal.should_be_active_at(15_000));
    }

    #[test]
    fn test_time_labels() {
        assert_eq!(time_of_day_label(0), "morning");
        assert_eq!(time_of_day_label(7_000), "noon");
        assert_eq!(time_of_day_label(24_000 + 13_000), "afternoon");
        assert_eq!(time_of_day_label(20_000), "night");
        assert!(is_night(24_000 + 14_000));
    }
}
