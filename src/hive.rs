//! 组合根：由配置构建端点注册表、调度器、NPC 子系统，并提供聊天入口与管理面
//!
//! 必须在 tokio runtime 内构建（工作池在构建时启动 worker 任务）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::{build_endpoints, env_lookup, AppConfig, EndpointSection};
use crate::core::{
    DecisionLimiter, DispatchError, MonotonicClock, OverflowPolicy, ShutdownCleanup,
    ShutdownCoordinator, ShutdownManager, WorkerPool,
};
use crate::llm::{
    Endpoint, EndpointRegistry, EndpointSelector, RegistryHealth, RequestDispatcher,
    SelectionPolicy,
};
use crate::memory::ConversationStore;
use crate::npc::{
    AgentRegistry, AgentSnapshot, DecisionExecutor, MovementSink, NpcManager, SchedulerStats,
    TieredScheduler, WorldView,
};
use crate::observability::{CountersSnapshot, PerformanceCounters};
use crate::persona::{Persona, PersonaRegistry};

/// 聊天入口错误
#[derive(Error, Debug, Clone)]
pub enum ChatError {
    #[error("Please wait {remaining_ms} ms before sending another message")]
    Cooldown { remaining_ms: u64 },

    #[error("Invalid message: {0}")]
    Invalid(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// 管理面汇总快照
#[derive(Debug, Clone, Serialize)]
pub struct AdminSnapshot {
    pub endpoints: RegistryHealth,
    pub counters: CountersSnapshot,
    pub conversations: usize,
    pub agents: Vec<AgentSnapshot>,
    pub scheduler: Option<SchedulerStats>,
}

/// 应用实例
pub struct Hive {
    config: AppConfig,
    clock: MonotonicClock,
    counters: Arc<PerformanceCounters>,
    registry: Arc<EndpointRegistry>,
    dispatcher: Arc<RequestDispatcher>,
    personas: Arc<PersonaRegistry>,
    npc: Option<Arc<NpcManager>>,
    last_chat_ms: Mutex<HashMap<String, u64>>,
}

impl Hive {
    /// 用进程环境中的凭据构建
    pub fn from_config(
        config: AppConfig,
        world: Arc<dyn WorldView>,
        sink: Arc<dyn MovementSink>,
    ) -> Self {
        let endpoints = build_endpoints(&config.llm.endpoints, env_lookup);
        Self::with_endpoints(config, endpoints, world, sink)
    }

    /// 用已构建好的端点构建（测试或嵌入方自带客户端时使用）
    pub fn with_endpoints(
        config: AppConfig,
        endpoints: Vec<Arc<Endpoint>>,
        world: Arc<dyn WorldView>,
        sink: Arc<dyn MovementSink>,
    ) -> Self {
        let clock = MonotonicClock::new();
        let counters = Arc::new(PerformanceCounters::new());

        let registry = Arc::new(EndpointRegistry::new(endpoints, clock));
        let policy = config.llm.selection_policy().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "falling back to weighted_random");
            SelectionPolicy::default()
        });
        let selector = Arc::new(EndpointSelector::new(Arc::clone(&registry), policy));
        let store = Arc::new(ConversationStore::new(config.app.max_history, clock));
        let dispatcher = Arc::new(RequestDispatcher::new(
            selector,
            Arc::clone(&store),
            Arc::clone(&counters),
            clock,
            config.llm.retry_policy(),
        ));
        let personas = Arc::new(PersonaRegistry::new(config.personas()));

        let npc = config.npc.enabled.then(|| {
            Arc::new(build_npc(
                &config,
                clock,
                &counters,
                &dispatcher,
                &store,
                &personas,
                world,
                sink,
            ))
        });

        tracing::info!(
            name = config.app.name.as_deref().unwrap_or("hive"),
            endpoints = registry.len(),
            ?policy,
            npc = npc.is_some(),
            "hive initialized"
        );

        Self {
            config,
            clock,
            counters,
            registry,
            dispatcher,
            personas,
            npc,
            last_chat_ms: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    pub fn npc(&self) -> Option<&Arc<NpcManager>> {
        self.npc.as_ref()
    }

    /// 生成配置中的 Agent 并启动调度；返回成功生成的数量
    pub fn start(&self) -> usize {
        let Some(npc) = &self.npc else {
            return 0;
        };
        let bounds = self.config.npc.executor_config().bounds;
        let mut spawned = 0;
        for section in &self.config.npc.agents {
            let result = section
                .to_spec(|key| self.personas.contains(key), bounds)
                .map_err(|e| e.to_string())
                .and_then(|spec| npc.spawn(spec).map_err(|e| e.to_string()));
            match result {
                Ok(_) => spawned += 1,
                Err(e) => tracing::warn!(agent_id = %section.id, error = %e, "skipping agent"),
            }
        }
        npc.scheduler().start();
        spawned
    }

    // ---- 聊天入口 ----

    /// 玩家聊天：校验、冷却、人设，然后经调度器补全
    pub async fn chat(&self, player_id: &str, message: &str) -> Result<String, ChatError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ChatError::Invalid("message is empty".into()));
        }
        let max_chars = self.config.app.max_message_chars;
        if message.chars().count() > max_chars {
            return Err(ChatError::Invalid(format!(
                "message exceeds {max_chars} characters"
            )));
        }
        self.check_cooldown(player_id)?;

        let persona = self.personas.current_for(player_id);
        let reply = self
            .dispatcher
            .complete(player_id, message, persona.as_ref().map(|p| p.context.as_str()))
            .await?;
        Ok(reply)
    }

    fn check_cooldown(&self, player_id: &str) -> Result<(), ChatError> {
        let cooldown = self.config.app.chat_cooldown_ms;
        let now = self.clock.now_ms();
        let mut last = self.last_chat_ms.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(&previous) = last.get(player_id) {
            let elapsed = now.saturating_sub(previous);
            if elapsed < cooldown {
                return Err(ChatError::Cooldown {
                    remaining_ms: cooldown - elapsed,
                });
            }
        }
        last.insert(player_id.to_string(), now);
        Ok(())
    }

    /// 切换玩家人设；实际发生切换时清空该玩家的对话
    pub async fn select_persona(&self, player_id: &str, key: &str) -> Result<bool, ChatError> {
        match self.personas.select(player_id, key) {
            None => Err(ChatError::Invalid(format!("unknown persona '{key}'"))),
            Some(changed) => {
                if changed {
                    self.dispatcher.store().clear(player_id).await;
                }
                Ok(changed)
            }
        }
    }

    pub fn current_persona(&self, player_id: &str) -> Option<Arc<Persona>> {
        self.personas.current_for(player_id)
    }

    pub fn persona_keys(&self) -> Vec<String> {
        self.personas.keys()
    }

    /// 玩家离开：清理冷却、人设选择，并让与其交互的 Agent 回到 Idle
    pub fn player_left(&self, player_id: &str) {
        self.last_chat_ms
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(player_id);
        self.personas.forget_player(player_id);
        if let Some(npc) = &self.npc {
            npc.observer_left(player_id);
        }
    }

    pub async fn clear_history(&self, conversation_id: &str) -> bool {
        self.dispatcher.store().clear(conversation_id).await
    }

    pub async fn clear_all_history(&self) -> usize {
        self.dispatcher.store().clear_all().await
    }

    // ---- 管理面 ----

    pub fn endpoint_health(&self) -> RegistryHealth {
        self.registry.health()
    }

    pub fn reset_endpoints(&self) {
        self.registry.reset_all();
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    pub fn agent_snapshots(&self) -> Vec<AgentSnapshot> {
        self.npc.as_ref().map(|n| n.snapshots()).unwrap_or_default()
    }

    pub async fn admin_snapshot(&self) -> AdminSnapshot {
        AdminSnapshot {
            endpoints: self.endpoint_health(),
            counters: self.counters(),
            conversations: self.dispatcher.store().len().await,
            agents: self.agent_snapshots(),
            scheduler: self.npc.as_ref().map(|n| n.stats()),
        }
    }

    /// 用新的端点定义替换注册表（健康状态随之重置），返回可用端点数
    pub fn reload_endpoints(&self, sections: &[EndpointSection]) -> usize {
        let endpoints = build_endpoints(sections, env_lookup);
        let count = endpoints.len();
        if count == 0 {
            tracing::warn!("reload produced no usable endpoints, running degraded");
        }
        self.registry.replace(endpoints);
        count
    }

    /// 重新读取配置文件并重载端点
    pub fn reload_from_disk(&self, path: Option<PathBuf>) -> Result<usize, config::ConfigError> {
        let config = crate::config::reload_config(path)?;
        Ok(self.reload_endpoints(&config.llm.endpoints))
    }

    /// 关闭协调器：先停调度器（排空工作池），再清空会话
    pub fn shutdown_coordinator(&self, manager: Arc<ShutdownManager>) -> ShutdownCoordinator {
        let mut coordinator = ShutdownCoordinator::new(manager);
        if let Some(npc) = &self.npc {
            coordinator.register_shared(Arc::clone(npc.scheduler()) as Arc<dyn ShutdownCleanup>);
        }
        coordinator.register(ConversationCleanup {
            store: Arc::clone(self.dispatcher.store()),
        });
        coordinator
    }
}

#[allow(clippy::too_many_arguments)]
fn build_npc(
    config: &AppConfig,
    clock: MonotonicClock,
    counters: &Arc<PerformanceCounters>,
    dispatcher: &Arc<RequestDispatcher>,
    store: &Arc<ConversationStore>,
    personas: &Arc<PersonaRegistry>,
    world: Arc<dyn WorldView>,
    sink: Arc<dyn MovementSink>,
) -> NpcManager {
    let npc = &config.npc;
    let limiter = Arc::new(DecisionLimiter::new(
        npc.max_concurrent_ai_requests,
        clock,
        Arc::clone(counters),
    ));
    let ai_pool = Arc::new(WorkerPool::new(
        "npc-ai",
        npc.ai_workers,
        npc.ai_queue,
        OverflowPolicy::DropOldest,
        Arc::clone(counters),
    ));
    let batch_pool = Arc::new(WorkerPool::new(
        "npc-batch",
        npc.batch_workers,
        npc.batch_queue,
        OverflowPolicy::RunInCaller,
        Arc::clone(counters),
    ));
    let executor = Arc::new(DecisionExecutor::new(
        Arc::clone(dispatcher),
        Arc::clone(&limiter),
        ai_pool,
        world,
        sink,
        Arc::clone(personas),
        clock,
        npc.executor_config(),
    ));
    let agents = Arc::new(AgentRegistry::new());
    let scheduler = Arc::new(TieredScheduler::new(
        Arc::clone(&agents),
        Arc::clone(&executor),
        Arc::clone(&limiter),
        Arc::clone(store),
        batch_pool,
        clock,
        npc.scheduler_config(),
    ));
    NpcManager::new(agents, executor, scheduler, limiter)
}

/// 关闭时清空全部会话
struct ConversationCleanup {
    store: Arc<ConversationStore>,
}

#[async_trait]
impl ShutdownCleanup for ConversationCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let cleared = self.store.clear_all().await;
        tracing::info!(cleared, "conversations cleared");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "conversations"
    }
}
