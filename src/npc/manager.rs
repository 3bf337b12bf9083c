//! NPC 管理门面：生成 / 移除、环境事件、玩家对话、调度统计

use std::sync::Arc;

use super::agent::{Agent, AgentRegistry, AgentSnapshot, AgentSpec, AgentState};
use super::decision::dialogue_prompt;
use super::executor::{DamageResponse, DecisionExecutor, ExecutorStats};
use super::scheduler::{SchedulerStats, TieredScheduler};
use crate::core::{DecisionLimiter, DispatchError, NpcError};

/// 玩家与 Agent 对话使用的会话 id
pub fn dialogue_conversation_id(agent_id: &str, observer_id: &str) -> String {
    format!("npc_{agent_id}_{observer_id}")
}

/// NPC 管理器
pub struct NpcManager {
    agents: Arc<AgentRegistry>,
    executor: Arc<DecisionExecutor>,
    scheduler: Arc<TieredScheduler>,
    limiter: Arc<DecisionLimiter>,
}

impl NpcManager {
    pub fn new(
        agents: Arc<AgentRegistry>,
        executor: Arc<DecisionExecutor>,
        scheduler: Arc<TieredScheduler>,
        limiter: Arc<DecisionLimiter>,
    ) -> Self {
        Self {
            agents,
            executor,
            scheduler,
            limiter,
        }
    }

    pub fn scheduler(&self) -> &Arc<TieredScheduler> {
        &self.scheduler
    }

    pub fn executor(&self) -> &Arc<DecisionExecutor> {
        &self.executor
    }

    pub fn limiter(&self) -> &Arc<DecisionLimiter> {
        &self.limiter
    }

    /// 生成 Agent：登记、限流簿记、通知宿主生成实体
    pub fn spawn(&self, spec: AgentSpec) -> Result<Arc<Agent>, NpcError> {
        let now = self.executor.clock().now_ms();
        let agent = Arc::new(Agent::new(spec, now));
        if !self.agents.insert(Arc::clone(&agent)) {
            return Err(NpcError::DuplicateAgent(agent.id().to_string()));
        }
        self.limiter.register(agent.id());
        let sink = self.executor.sink();
        sink.spawn_entity(agent.id(), agent.spawn());
        sink.set_visual_state(agent.id(), AgentState::Idle);
        tracing::info!(agent_id = agent.id(), name = agent.display_name(), "agent spawned");
        Ok(agent)
    }

    /// 移除 Agent：释放会话与调度簿记；在途决策回来时会被丢弃
    pub async fn despawn(&self, agent_id: &str) -> Result<(), NpcError> {
        let agent = self
            .agents
            .remove(agent_id)
            .ok_or_else(|| NpcError::UnknownAgent(agent_id.to_string()))?;
        agent.clear_conversations();
        self.limiter.remove(agent_id);
        let store = self.executor.dispatcher().store();
        let decision_id = DecisionExecutor::decision_conversation_id(agent_id);
        let mut cleared = usize::from(store.clear(&decision_id).await);
        cleared += store.clear_prefix(&format!("{decision_id}_")).await;
        self.executor.sink().despawn_entity(agent_id);
        tracing::info!(agent_id, cleared, "agent despawned");
        Ok(())
    }

    /// 移除全部 Agent
    pub async fn despawn_all(&self) -> usize {
        let ids: Vec<String> = self.agents.all().iter().map(|a| a.id().to_string()).collect();
        let mut removed = 0;
        for id in ids {
            if self.despawn(&id).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<Agent>> {
        self.agents.get(agent_id)
    }

    pub fn list(&self) -> Vec<Arc<Agent>> {
        self.agents.all()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// 观察者 range 内的 Agent，按距离升序
    pub fn nearby_agents(&self, observer_id: &str, range: f64) -> Vec<Arc<Agent>> {
        let world = self.executor.world();
        let Some(origin) = world.observer_position(observer_id) else {
            return Vec::new();
        };
        let mut nearby: Vec<(f64, Arc<Agent>)> = self
            .agents
            .all()
            .into_iter()
            .filter_map(|a| {
                let pos = world.current_position(a.id()).unwrap_or_else(|| a.position());
                let d = origin.distance(&pos);
                (d <= range).then_some((d, a))
            })
            .collect();
        nearby.sort_by(|a, b| a.0.total_cmp(&b.0));
        nearby.into_iter().map(|(_, a)| a).collect()
    }

    fn require(&self, agent_id: &str) -> Result<Arc<Agent>, NpcError> {
        self.agents
            .get(agent_id)
            .ok_or_else(|| NpcError::UnknownAgent(agent_id.to_string()))
    }

    // ---- 环境事件 ----

    /// 观察者下线：所有与其交互中的 Agent 回到 Idle，返回受影响数量
    pub fn observer_left(&self, observer_id: &str) -> usize {
        self.agents
            .all()
            .iter()
            .filter(|a| self.executor.observer_left(a, observer_id))
            .count()
    }

    pub fn begin_dialogue(&self, agent_id: &str, observer_id: &str) -> Result<(), NpcError> {
        let agent = self.require(agent_id)?;
        self.executor.begin_dialogue(&agent, observer_id);
        Ok(())
    }

    pub fn end_dialogue(&self, agent_id: &str) -> Result<Option<AgentState>, NpcError> {
        let agent = self.require(agent_id)?;
        Ok(self.executor.end_dialogue(&agent))
    }

    pub fn on_damaged(&self, agent_id: &str, attacker: Option<&str>) -> Result<DamageResponse, NpcError> {
        let agent = self.require(agent_id)?;
        let response = self.executor.on_damaged(&agent, attacker);
        tracing::debug!(agent_id, ?attacker, ?response, "agent damaged");
        Ok(response)
    }

    /// 玩家对 Agent 说话：进入 Talking，经调度器生成回复并记入该玩家的对话记忆。
    /// 服务不可用时返回一句占位回复而不是错误。
    pub async fn converse(
        &self,
        agent_id: &str,
        observer_id: &str,
        message: &str,
    ) -> Result<String, NpcError> {
        let agent = self.require(agent_id)?;
        if agent.state() == AgentState::Sleeping {
            return Err(NpcError::Asleep(agent_id.to_string()));
        }

        self.executor.begin_dialogue(&agent, observer_id);
        let history = agent.conversation_with(observer_id);
        let prompt = dialogue_prompt(
            &agent,
            observer_id,
            message,
            &history,
            self.executor.world().world_time_of_day(),
        );
        let persona = self.executor.persona_context(&agent);
        let result = self
            .executor
            .dispatcher()
            .complete(
                &dialogue_conversation_id(agent_id, observer_id),
                &prompt,
                persona.as_deref(),
            )
            .await;

        match result {
            Ok(reply) => {
                let now = self.executor.clock().now_ms();
                agent.record_exchange(observer_id, message, &reply, now);
                agent.touch(now);
                self.executor.extend_dialogue(&agent);
                Ok(reply)
            }
            Err(DispatchError::NoServiceAvailable { attempts, .. }) => {
                tracing::warn!(agent_id, observer_id, attempts, "dialogue failed, using placeholder");
                Ok(format!("{} seems to be thinking...", agent.display_name()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 管理面：全部 Agent 快照
    pub fn snapshots(&self) -> Vec<AgentSnapshot> {
        self.agents
            .all()
            .iter()
            .map(|a| a.snapshot(self.limiter.is_processing(a.id())))
            .collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }
}
