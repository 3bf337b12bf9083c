//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__POLICY=failover`）。
//! 单个端点 / Agent 定义有误时只跳过该条并记 warn，其余照常构建。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::core::ConfigError;
use crate::llm::{
    Endpoint, EndpointSpec, LlmClient, MockLlmClient, ModelParams, OpenAiClient, Provider,
    RetryPolicy, SelectionPolicy,
};
use crate::npc::{AgentSpec, BehaviorConfig, ExecutorConfig, Position, SchedulerConfig, WorldBounds};
use crate::persona::Persona;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub npc: NpcSection,
    pub personas: BTreeMap<String, PersonaSection>,
}

/// [app] 段：应用名、对话轮数上限、聊天冷却与长度限制
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 每个会话保留的轮数（一轮 = user + assistant）
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_chat_cooldown_ms")]
    pub chat_cooldown_ms: u64,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_history: default_max_history(),
            chat_cooldown_ms: default_chat_cooldown_ms(),
            max_message_chars: default_max_message_chars(),
        }
    }
}

fn default_max_history() -> usize {
    10
}

fn default_chat_cooldown_ms() -> u64 {
    3_000
}

fn default_max_message_chars() -> usize {
    2_000
}

/// [llm] 段：选择策略、重试与端点列表
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// single / weighted_random / failover
    #[serde(default = "default_policy")]
    pub policy: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub endpoints: Vec<EndpointSection>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            endpoints: Vec::new(),
        }
    }
}

fn default_policy() -> String {
    "weighted_random".to_string()
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl LlmSection {
    pub fn selection_policy(&self) -> Result<SelectionPolicy, ConfigError> {
        self.policy.parse()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

/// [[llm.endpoints]]：单个后端端点
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSection {
    pub id: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// 凭据所在的环境变量名；未设置时用 provider 的默认变量
    pub api_key_env: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_window_ms")]
    pub recovery_window_ms: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_weight() -> f64 {
    1.0
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    crate::llm::endpoint::DEFAULT_FAILURE_THRESHOLD
}

fn default_recovery_window_ms() -> u64 {
    crate::llm::endpoint::DEFAULT_RECOVERY_WINDOW_MS
}

impl EndpointSection {
    /// 构建端点；`lookup` 解析凭据环境变量（测试中可注入）
    pub fn build<F>(&self, lookup: F) -> Result<Endpoint, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider = Provider::parse(&self.id, &self.provider)?;
        let model = match &self.model {
            Some(m) if m.trim().is_empty() => return Err(ConfigError::MissingModel(self.id.clone())),
            Some(m) => m.clone(),
            None => provider.default_model().to_string(),
        };
        let spec = EndpointSpec::new(&self.id, &model)
            .with_weight(self.weight)
            .with_failure_threshold(self.failure_threshold)
            .with_recovery_window_ms(self.recovery_window_ms);
        spec.validate()?;

        let client: Arc<dyn LlmClient> = match provider {
            Provider::Mock => Arc::new(MockLlmClient::new()),
            _ => {
                let var = self
                    .api_key_env
                    .as_deref()
                    .or(provider.default_key_env())
                    .unwrap_or_default();
                let api_key = lookup(var)
                    .filter(|k| !k.trim().is_empty())
                    .ok_or_else(|| ConfigError::MissingCredential {
                        endpoint: self.id.clone(),
                        var: var.to_string(),
                    })?;
                let params = ModelParams {
                    model,
                    temperature: self.temperature,
                    max_tokens: self.max_tokens,
                    timeout: Duration::from_millis(self.timeout_ms),
                };
                let base_url = self.base_url.as_deref().or(provider.default_base_url());
                Arc::new(OpenAiClient::new(base_url, &api_key, params))
            }
        };
        Endpoint::new(spec, client)
    }
}

/// 按顺序构建全部端点，失败的条目记 warn 后跳过
pub fn build_endpoints<F>(sections: &[EndpointSection], lookup: F) -> Vec<Arc<Endpoint>>
where
    F: Fn(&str) -> Option<String>,
{
    sections
        .iter()
        .filter_map(|section| match section.build(&lookup) {
            Ok(endpoint) => Some(Arc::new(endpoint)),
            Err(e) => {
                tracing::warn!(endpoint = %section.id, error = %e, "skipping endpoint");
                None
            }
        })
        .collect()
}

/// 从进程环境读取凭据
pub fn env_lookup(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// [npc] 段：限流、分层调度、工作池与 Agent 定义
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NpcSection {
    pub enabled: bool,
    pub tiering: bool,
    pub max_concurrent_ai_requests: usize,
    pub max_active_agents: usize,
    pub batch_size: usize,
    pub nearby_range: f64,
    pub active_tick_ms: u64,
    pub inactive_tick_ms: u64,
    pub maintenance_interval_ms: u64,
    pub conversation_idle_timeout_ms: u64,
    pub batch_workers: usize,
    pub batch_queue: usize,
    pub ai_workers: usize,
    pub ai_queue: usize,
    pub world_min_y: f64,
    pub world_max_y: f64,
    pub dialogue_grace_ms: u64,
    pub agents: Vec<AgentSection>,
}

impl Default for NpcSection {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        let executor = ExecutorConfig::default();
        Self {
            enabled: true,
            tiering: scheduler.tiering,
            max_concurrent_ai_requests: 4,
            max_active_agents: scheduler.max_active_agents,
            batch_size: scheduler.batch_size,
            nearby_range: scheduler.nearby_range,
            active_tick_ms: scheduler.active_tick_ms,
            inactive_tick_ms: scheduler.inactive_tick_ms,
            maintenance_interval_ms: scheduler.maintenance_interval_ms,
            conversation_idle_timeout_ms: scheduler.conversation_idle_timeout_ms,
            batch_workers: 4,
            batch_queue: 64,
            ai_workers: 2,
            ai_queue: 32,
            world_min_y: executor.bounds.min_y,
            world_max_y: executor.bounds.max_y,
            dialogue_grace_ms: executor.dialogue_grace_ms,
            agents: Vec::new(),
        }
    }
}

impl NpcSection {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tiering: self.tiering,
            max_active_agents: self.max_active_agents,
            batch_size: self.batch_size.max(1),
            nearby_range: self.nearby_range,
            active_tick_ms: self.active_tick_ms,
            inactive_tick_ms: self.inactive_tick_ms,
            maintenance_interval_ms: self.maintenance_interval_ms,
            conversation_idle_timeout_ms: self.conversation_idle_timeout_ms,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            bounds: WorldBounds {
                min_y: self.world_min_y,
                max_y: self.world_max_y,
            },
            nearby_range: self.nearby_range,
            dialogue_grace_ms: self.dialogue_grace_ms,
        }
    }
}

/// [[npc.agents]]：单个 Agent 定义
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    pub id: String,
    pub display_name: Option<String>,
    pub persona: Option<String>,
    pub spawn: Position,
    #[serde(default)]
    pub behavior: BehaviorSection,
}

impl AgentSection {
    /// 校验并转换；persona 必须是已配置的 key
    pub fn to_spec(
        &self,
        known_persona: impl Fn(&str) -> bool,
        bounds: WorldBounds,
    ) -> Result<AgentSpec, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidAgent(self.id.clone(), reason.to_string());
        if self.id.trim().is_empty() {
            return Err(invalid("empty id"));
        }
        if self.spawn.y < bounds.min_y || self.spawn.y > bounds.max_y {
            return Err(invalid("spawn height outside world bounds"));
        }
        let mut spec = AgentSpec::new(&self.id, self.spawn).with_behavior(self.behavior.to_config());
        if let Some(name) = &self.display_name {
            spec = spec.with_display_name(name);
        }
        if let Some(persona) = &self.persona {
            if !known_persona(persona) {
                return Err(invalid(&format!("unknown persona '{persona}'")));
            }
            spec = spec.with_persona(persona);
        }
        Ok(spec)
    }
}

/// [npc.agents.behavior]：缺省值与 BehaviorConfig::default 一致
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BehaviorSection {
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

impl Default for BehaviorSection {
    fn default() -> Self {
        let d = BehaviorConfig::default();
        Self {
            wander_radius: d.wander_radius,
            interaction_range: d.interaction_range,
            movement_speed: d.movement_speed,
            decision_interval_ms: d.decision_interval_ms,
            max_conversation_history: d.max_conversation_history,
            follow_distance: d.follow_distance,
            max_follow_time_ms: d.max_follow_time_ms,
            active_at_day: d.active_at_day,
            active_at_night: d.active_at_night,
            sleep_at_night: d.sleep_at_night,
            aggressive: d.aggressive,
            invulnerable: d.invulnerable,
            can_follow: d.can_follow,
            behavior_weights: d.behavior_weights,
        }
    }
}

impl BehaviorSection {
    pub fn to_config(&self) -> BehaviorConfig {
        let builder = BehaviorConfig::builder()
            .wander_radius(self.wander_radius)
            .interaction_range(self.interaction_range)
            .movement_speed(self.movement_speed)
            .decision_interval_ms(self.decision_interval_ms)
            .max_conversation_history(self.max_conversation_history)
            .follow_distance(self.follow_distance)
            .max_follow_time_ms(self.max_follow_time_ms)
            .active_at_day(self.active_at_day)
            .active_at_night(self.active_at_night)
            .sleep_at_night(self.sleep_at_night)
            .aggressive(self.aggressive)
            .invulnerable(self.invulnerable)
            .can_follow(self.can_follow);
        self.behavior_weights
            .iter()
            .fold(builder, |b, (name, w)| b.behavior_weight(name, *w))
            .build()
    }
}

/// [personas.<key>]
#[derive(Debug, Clone, Deserialize)]
pub struct PersonaSection {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub context: String,
}

impl From<&PersonaSection> for Persona {
    fn from(s: &PersonaSection) -> Self {
        Persona::new(&s.name, &s.description, &s.context)
    }
}

impl AppConfig {
    pub fn personas(&self) -> BTreeMap<String, Persona> {
        self.personas
            .iter()
            .map(|(key, section)| (key.clone(), Persona::from(section)))
            .collect()
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

/// 只读取指定文件（不查找默认位置），同样叠加 HIVE__* 环境变量
pub fn load_config_file(path: &std::path::Path) -> Result<AppConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::from(path.to_path_buf()))
        .add_source(
            config::Environment::with_prefix("HIVE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（调用方据此重建端点注册表）
pub fn reload_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    load_config(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[app]
name = "test"
max_history = 4

[llm]
policy = "failover"
max_retries = 1

[[llm.endpoints]]
id = "primary"
provider = "deepseek"
weight = 5.0

[[llm.endpoints]]
id = "local"
provider = "mock"

[[llm.endpoints]]
id = "broken"
provider = "openai"
model = "  "

[npc]
batch_size = 2

[[npc.agents]]
id = "bob"
display_name = "Bob"
persona = "guard"
spawn = { x = 1.0, y = 64.0, z = -3.0 }

[npc.agents.behavior]
wander_radius = 8.0
sleep_at_night = true
behavior_weights = { patrol = 2.0 }

[personas.guard]
name = "Guard"
context = "You guard the gate."
"#;

    fn load_sample() -> AppConfig {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        load_config_file(file.path()).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.max_history, 10);
        assert_eq!(cfg.app.chat_cooldown_ms, 3_000);
        assert_eq!(cfg.llm.max_retries, 2);
        assert_eq!(cfg.llm.selection_policy(), Ok(SelectionPolicy::WeightedRandom));
        assert!(cfg.npc.tiering);
        assert_eq!(cfg.npc.max_concurrent_ai_requests, 4);
    }

    #[test]
    fn test_load_from_file() {
        let cfg = load_sample();
        assert_eq!(cfg.app.max_history, 4);
        assert_eq!(cfg.llm.selection_policy(), Ok(SelectionPolicy::Failover));
        assert_eq!(cfg.llm.retry_policy().max_retries, 1);
        assert_eq!(cfg.llm.endpoints.len(), 3);
        assert_eq!(cfg.llm.endpoints[0].timeout_ms, 30_000);
        assert_eq!(cfg.npc.scheduler_config().batch_size, 2);
        assert_eq!(cfg.personas()["guard"].name, "Guard");
    }

    #[test]
    fn test_bad_endpoints_are_skipped() {
        let cfg = load_sample();
        let lookup = |var: &str| (var == "DEEPSEEK_API_KEY").then(|| "sk-test".to_string());
        let endpoints = build_endpoints(&cfg.llm.endpoints, lookup);
        let ids: Vec<_> = endpoints.iter().map(|e| e.id().to_string()).collect();
        assert_eq!(ids, vec!["primary", "local"]);
        assert_eq!(endpoints[0].model(), "deepseek-chat");
        assert_eq!(endpoints[0].weight(), 5.0);

        let err = cfg.llm.endpoints[0].build(|_| None).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingCredential {
                endpoint: "primary".into(),
                var: "DEEPSEEK_API_KEY".into()
            }
        );
        assert_eq!(
            cfg.llm.endpoints[2].build(|_| Some("k".into())).unwrap_err(),
            ConfigError::MissingModel("broken".into())
        );
    }

    #[test]
    fn test_agent_definitions() {
        let cfg = load_sample();
        let bounds = cfg.npc.executor_config().bounds;
        let agent = &cfg.npc.agents[0];
        let spec = agent.to_spec(|k| k == "guard", bounds).unwrap();
        assert_eq!(spec.display_name, "Bob");
        assert_eq!(spec.persona.as_deref(), Some("guard"));
        assert_eq!(spec.behavior.wander_radius, 8.0);
        assert_eq!(spec.behavior.decision_interval_ms, 3_000);
        assert_eq!(spec.behavior.weight("patrol"), 2.0);
        assert!(spec.behavior.sleep_at_night);

        assert!(matches!(
            agent.to_spec(|_| false, bounds),
            Err(ConfigError::InvalidAgent(_, _))
        ));
    }
}
