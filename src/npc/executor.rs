//! 决策 / 行为执行器
//!
//! - 廉价更新：同步位置、对话宽限到期、交互对象下线、作息（Sleeping / 唤醒）
//! - 完整更新：廉价更新 + 经限流器发起 AI 决策 + 按当前状态执行一步移动
//!
//! AI 决策作为任务提交到 AI 工作池，调用方立即返回；结果回来时先检查 Agent 是否仍存活，
//! 再用 compare_exchange 从「发起时观察到的状态」切换，期间状态被其他事件改变则丢弃结果。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use super::agent::{Agent, AgentState};
use super::decision::{decision_prompt, is_valid_target, resolve_target, Decision, WorldBounds, MOVE_DISTANCE};
use super::world::{MovementSink, Position, WorldView};
use crate::core::{Admission, DecisionLimiter, DispatchError, MonotonicClock, SubmitOutcome, WorkerPool};
use crate::llm::RequestDispatcher;
use crate::persona::PersonaRegistry;

/// 到达判定距离
const ARRIVE_DISTANCE: f64 = 1.0;
/// 游荡 / 巡逻重新选点的距离
const REPICK_DISTANCE: f64 = 2.0;
const PATROL_RADIUS_CAP: f64 = 10.0;

/// 执行器参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutorConfig {
    pub bounds: WorldBounds,
    pub nearby_range: f64,
    pub dialogue_grace_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            bounds: WorldBounds::default(),
            nearby_range: 20.0,
            dialogue_grace_ms: 5_000,
        }
    }
}

/// 发起决策的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionRequest {
    Submitted,
    NotDue,
    Busy,
    Saturated,
    /// 当前状态不做移动决策（Talking / Sleeping / 已移除）
    Skipped,
    /// AI 池已关闭
    Rejected,
}

/// 决策结果的应用情况
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(AgentState),
    /// 调度失败，降级为 Idle
    Defaulted,
    /// 状态在请求期间被改变，结果作废
    Stale,
    /// Agent 已被移除
    Discarded,
}

/// 受到伤害时宿主应采取的处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DamageResponse {
    /// 无敌：宿主取消这次伤害
    Cancel,
    Flee,
    Ignore,
}

/// 执行器计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub decisions_applied: u64,
    pub decisions_defaulted: u64,
    pub decisions_discarded: u64,
}

/// 决策 / 行为执行器
pub struct DecisionExecutor {
    dispatcher: Arc<RequestDispatcher>,
    limiter: Arc<DecisionLimiter>,
    ai_pool: Arc<WorkerPool>,
    world: Arc<dyn WorldView>,
    sink: Arc<dyn MovementSink>,
    personas: Arc<PersonaRegistry>,
    clock: MonotonicClock,
    config: ExecutorConfig,
    rng: Mutex<SmallRng>,
    applied: AtomicU64,
    defaulted: AtomicU64,
    discarded: AtomicU64,
}

impl DecisionExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dispatcher: Arc<RequestDispatcher>,
        limiter: Arc<DecisionLimiter>,
        ai_pool: Arc<WorkerPool>,
        world: Arc<dyn WorldView>,
        sink: Arc<dyn MovementSink>,
        personas: Arc<PersonaRegistry>,
        clock: MonotonicClock,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            dispatcher,
            limiter,
            ai_pool,
            world,
            sink,
            personas,
            clock,
            config,
            rng: Mutex::new(SmallRng::from_entropy()),
            applied: AtomicU64::new(0),
            defaulted: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> ExecutorConfig {
        self.config
    }

    pub fn world(&self) -> &Arc<dyn WorldView> {
        &self.world
    }

    pub fn sink(&self) -> &Arc<dyn MovementSink> {
        &self.sink
    }

    pub fn clock(&self) -> MonotonicClock {
        self.clock
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    pub fn personas(&self) -> &Arc<PersonaRegistry> {
        &self.personas
    }

    pub fn ai_pool(&self) -> &Arc<WorkerPool> {
        &self.ai_pool
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            decisions_applied: self.applied.load(Ordering::Relaxed),
            decisions_defaulted: self.defaulted.load(Ordering::Relaxed),
            decisions_discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    /// Agent 决策使用的会话 id
    pub fn decision_conversation_id(agent_id: &str) -> String {
        format!("npc_{agent_id}")
    }

    pub fn persona_context(&self, agent: &Agent) -> Option<String> {
        agent
            .persona()
            .and_then(|key| self.personas.get(key))
            .map(|p| p.context.clone())
    }

    // ---- 更新入口 ----

    /// 低频层：只做状态 / 作息检查，不发起 AI 调用
    pub fn cheap_update(&self, agent: &Agent) {
        if !agent.is_alive() {
            return;
        }
        if let Some(position) = self.world.current_position(agent.id()) {
            agent.set_position(position);
        }
        let now = self.clock.now_ms();
        self.check_counterpart(agent, now);
        self.check_schedule(agent);
    }

    /// 高频层：廉价更新 + AI 决策 + 一步移动
    pub async fn full_update(self: &Arc<Self>, agent: &Arc<Agent>) -> DecisionRequest {
        self.cheap_update(agent);
        agent.touch(self.clock.now_ms());
        let request = self.request_decision(agent).await;
        self.execute_behavior(agent);
        request
    }

    // ---- 环境检查 ----

    fn check_counterpart(&self, agent: &Agent, now: u64) {
        let (state, grace) = agent.talk_view();
        if state == AgentState::Talking {
            if let Some(grace) = grace {
                if now >= grace.until_ms {
                    if let Some(restored) = agent.end_talk() {
                        tracing::debug!(agent_id = agent.id(), %restored, "dialogue grace expired");
                        self.sink.set_visual_state(agent.id(), restored);
                    }
                    return;
                }
            }
        }

        if matches!(state, AgentState::Talking | AgentState::Following) {
            if let Some(counterpart) = agent.counterpart() {
                if !self.world.observer_online(&counterpart) {
                    self.observer_left(agent, &counterpart);
                    return;
                }
            }
        }

        if state == AgentState::Following {
            let max_follow = agent.behavior().max_follow_time_ms;
            if let Some(since) = agent.follow_since_ms() {
                if max_follow > 0
                    && now.saturating_sub(since) > max_follow
                    && agent.transition(AgentState::Following, AgentState::Idle)
                {
                    agent.clear_counterpart(None);
                    self.sink.set_visual_state(agent.id(), AgentState::Idle);
                }
            }
        }
    }

    fn check_schedule(&self, agent: &Agent) {
        let active = agent
            .behavior()
            .should_be_active_at(self.world.world_time_of_day());
        let state = agent.state();
        if !active && !matches!(state, AgentState::Sleeping | AgentState::Talking) {
            if agent.transition(state, AgentState::Sleeping) {
                agent.set_target(None);
                agent.clear_counterpart(None);
                self.sink.set_visual_state(agent.id(), AgentState::Sleeping);
                tracing::debug!(agent_id = agent.id(), "going to sleep");
            }
        } else if active
            && state == AgentState::Sleeping
            && agent.transition(AgentState::Sleeping, AgentState::Idle)
        {
            self.sink.set_visual_state(agent.id(), AgentState::Idle);
            tracing::debug!(agent_id = agent.id(), "woke up");
        }
    }

    // ---- 环境事件 ----

    /// 交互对象离开 / 下线：Talking / Following 回到 Idle
    pub fn observer_left(&self, agent: &Agent, observer_id: &str) -> bool {
        if !agent.clear_counterpart(Some(observer_id)) {
            return false;
        }
        let reverted = match agent.state() {
            AgentState::Talking => agent.abandon_talk(AgentState::Idle),
            AgentState::Following => agent.transition(AgentState::Following, AgentState::Idle),
            _ => false,
        };
        if reverted {
            agent.set_target(None);
            self.sink.set_visual_state(agent.id(), AgentState::Idle);
        }
        reverted
    }

    /// 对方发起对话：进入 Talking，宽限期后恢复之前的状态
    pub fn begin_dialogue(&self, agent: &Agent, observer_id: &str) {
        let now = self.clock.now_ms();
        agent.begin_talk(observer_id, now + self.config.dialogue_grace_ms, now);
        agent.set_target(None);
        self.sink.set_visual_state(agent.id(), AgentState::Talking);
    }

    /// 对话中收到新消息：延长宽限期
    pub fn extend_dialogue(&self, agent: &Agent) {
        agent.extend_talk(self.clock.now_ms() + self.config.dialogue_grace_ms);
    }

    /// 对话结束：立即恢复之前的状态
    pub fn end_dialogue(&self, agent: &Agent) -> Option<AgentState> {
        let restored = agent.end_talk()?;
        self.sink.set_visual_state(agent.id(), restored);
        Some(restored)
    }

    pub fn on_damaged(&self, agent: &Agent, attacker: Option<&str>) -> DamageResponse {
        let behavior = agent.behavior();
        if behavior.invulnerable {
            return DamageResponse::Cancel;
        }
        if behavior.aggressive {
            return DamageResponse::Ignore;
        }
        agent.interrupt(AgentState::Fleeing);
        agent.set_target(None);
        agent.set_counterpart(attacker.map(String::from), self.clock.now_ms());
        self.sink.set_visual_state(agent.id(), AgentState::Fleeing);
        DamageResponse::Flee
    }

    // ---- AI 决策 ----

    /// 经限流器发起一次决策；不等待结果
    pub async fn request_decision(self: &Arc<Self>, agent: &Arc<Agent>) -> DecisionRequest {
        if !agent.is_alive() {
            return DecisionRequest::Skipped;
        }
        let observed = agent.state();
        if matches!(observed, AgentState::Talking | AgentState::Sleeping) {
            return DecisionRequest::Skipped;
        }

        let interval = agent.behavior().decision_interval_ms;
        let ticket = match self.limiter.try_admit(agent.id(), interval) {
            Admission::Granted(ticket) => ticket,
            Admission::NotDue { .. } => return DecisionRequest::NotDue,
            Admission::Busy => return DecisionRequest::Busy,
            Admission::Saturated => return DecisionRequest::Saturated,
        };

        let observers = self
            .world
            .nearby_observers(agent.id(), self.config.nearby_range);
        let prompt = decision_prompt(agent, &observers, self.world.world_time_of_day());
        let persona = self.persona_context(agent);
        let conversation_id = Self::decision_conversation_id(agent.id());

        let executor = Arc::clone(self);
        let target = Arc::clone(agent);
        let job = async move {
            // 持有 ticket 直到结果应用完毕
            let _ticket = ticket;
            let result = executor
                .dispatcher
                .complete(&conversation_id, &prompt, persona.as_deref())
                .await;
            executor.apply_decision(&target, observed, result);
        }
        .boxed();

        match self.ai_pool.submit(job).await {
            SubmitOutcome::Rejected => DecisionRequest::Rejected,
            _ => DecisionRequest::Submitted,
        }
    }

    /// 应用决策结果
    pub fn apply_decision(
        &self,
        agent: &Agent,
        observed: AgentState,
        result: Result<String, DispatchError>,
    ) -> ApplyOutcome {
        if !agent.is_alive() {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(agent_id = agent.id(), "decision arrived after removal, discarded");
            return ApplyOutcome::Discarded;
        }

        let text = match result {
            Ok(text) => text,
            Err(err) => {
                tracing::debug!(agent_id = agent.id(), error = %err, "decision failed, defaulting to idle");
                if agent.transition(observed, AgentState::Idle) {
                    agent.set_target(None);
                    self.sink.set_visual_state(agent.id(), AgentState::Idle);
                    self.defaulted.fetch_add(1, Ordering::Relaxed);
                    return ApplyOutcome::Defaulted;
                }
                self.discarded.fetch_add(1, Ordering::Relaxed);
                return ApplyOutcome::Stale;
            }
        };

        let decision = Decision::parse(&text);
        if !decision.well_formed {
            tracing::debug!(agent_id = agent.id(), response = %text, "unparsable decision, using idle");
        }
        let mut action = decision.action;
        // 没有对话对象时 TALK 没有意义
        if action == AgentState::Talking {
            action = AgentState::Idle;
        }

        let behavior = agent.behavior();
        let target = resolve_target(
            &agent.position(),
            &agent.spawn(),
            decision.direction,
            &behavior,
            self.config.bounds,
        );

        if !agent.transition(observed, action) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(agent_id = agent.id(), "state changed during decision, result dropped");
            return ApplyOutcome::Stale;
        }

        match action {
            AgentState::Idle | AgentState::Sleeping => agent.set_target(None),
            AgentState::Following => {
                let nearest = self
                    .world
                    .nearby_observers(agent.id(), self.config.nearby_range)
                    .into_iter()
                    .next();
                agent.set_counterpart(nearest.map(|o| o.id), self.clock.now_ms());
            }
            _ => {
                if target.is_some() {
                    agent.set_target(target);
                }
            }
        }

        self.sink.set_visual_state(agent.id(), action);
        self.applied.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            agent_id = agent.id(),
            %action,
            direction = ?decision.direction,
            reason = %decision.reason,
            "decision applied"
        );
        ApplyOutcome::Applied(action)
    }

    // ---- 行为 ----

    /// 按当前状态执行一步移动
    pub fn execute_behavior(&self, agent: &Agent) {
        if !agent.is_alive() {
            return;
        }
        match agent.state() {
            AgentState::MovingTo => self.move_to_target(agent),
            AgentState::Following => self.follow(agent),
            AgentState::Fleeing => self.flee(agent),
            AgentState::Wandering => self.wander(agent),
            AgentState::Patrolling => self.patrol(agent),
            AgentState::Idle | AgentState::Sleeping | AgentState::Talking => {}
        }
    }

    fn move_to_target(&self, agent: &Agent) {
        let Some(target) = agent.target() else {
            self.settle_idle(agent, AgentState::MovingTo);
            return;
        };
        if agent.position().distance(&target) < ARRIVE_DISTANCE {
            self.settle_idle(agent, AgentState::MovingTo);
            return;
        }
        self.step_towards(agent, target);
    }

    fn follow(&self, agent: &Agent) {
        let counterpart = agent
            .counterpart()
            .filter(|id| self.world.observer_online(id))
            .or_else(|| {
                let nearest = self
                    .world
                    .nearby_observers(agent.id(), self.config.nearby_range)
                    .into_iter()
                    .next()?;
                agent.set_counterpart(Some(nearest.id.clone()), self.clock.now_ms());
                Some(nearest.id)
            });
        let Some(target) = counterpart.and_then(|id| self.world.observer_position(&id)) else {
            self.settle_idle(agent, AgentState::Following);
            return;
        };
        if agent.position().distance(&target) > agent.behavior().follow_distance {
            self.step_towards(agent, target);
        }
    }

    fn flee(&self, agent: &Agent) {
        let observers = self
            .world
            .nearby_observers(agent.id(), self.config.nearby_range);
        if observers.is_empty() {
            self.settle_idle(agent, AgentState::Fleeing);
            return;
        }
        let current = agent.position();
        let away = observers.iter().fold(Position::default(), |acc, o| {
            acc.add(&current.sub(&o.position).normalized())
        });
        let flee_target = current.add(&away.normalized().scale(MOVE_DISTANCE));
        let behavior = agent.behavior();
        if is_valid_target(&agent.spawn(), &flee_target, behavior.wander_radius, self.config.bounds) {
            self.step_towards(agent, flee_target);
        }
    }

    fn wander(&self, agent: &Agent) {
        let target = match agent.target() {
            Some(t) if agent.position().distance(&t) >= REPICK_DISTANCE => t,
            _ => {
                let t = self.random_wander_point(agent);
                agent.set_target(Some(t));
                t
            }
        };
        self.step_towards(agent, target);
    }

    fn patrol(&self, agent: &Agent) {
        let target = match agent.target() {
            Some(t) if agent.position().distance(&t) >= REPICK_DISTANCE => t,
            _ => {
                let t = self.random_patrol_point(agent);
                agent.set_target(Some(t));
                t
            }
        };
        self.step_towards(agent, target);
    }

    fn settle_idle(&self, agent: &Agent, from: AgentState) {
        if agent.transition(from, AgentState::Idle) {
            agent.set_target(None);
            self.sink.set_visual_state(agent.id(), AgentState::Idle);
        }
    }

    fn random_wander_point(&self, agent: &Agent) -> Position {
        let spawn = agent.spawn();
        let radius = agent.behavior().wander_radius;
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        let dx = (rng.gen::<f64>() - 0.5) * 2.0 * radius;
        let dz = (rng.gen::<f64>() - 0.5) * 2.0 * radius;
        Position::new(spawn.x + dx, spawn.y, spawn.z + dz)
    }

    fn random_patrol_point(&self, agent: &Agent) -> Position {
        let spawn = agent.spawn();
        let radius = agent.behavior().wander_radius.min(PATROL_RADIUS_CAP);
        let angle = self
            .rng
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .gen_range(0.0..std::f64::consts::TAU);
        Position::new(
            spawn.x + angle.cos() * radius,
            spawn.y,
            spawn.z + angle.sin() * radius,
        )
    }

    /// 以 movement_speed 向目标移动一步；y 直接取目标高度
    fn step_towards(&self, agent: &Agent, target: Position) {
        let current = agent.position();
        let speed = agent.behavior().movement_speed;
        let delta = target.sub(&current);
        let step = if delta.length() <= speed {
            delta
        } else {
            delta.normalized().scale(speed)
        };
        let mut next = current.add(&step);
        next.y = target.y;
        agent.set_position(next);
        self.sink.teleport_towards(agent.id(), next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OverflowPolicy;
    use crate::llm::{
        Endpoint, EndpointRegistry, EndpointSelector, EndpointSpec, MockLlmClient, RetryPolicy,
        SelectionPolicy,
    };
    use crate::memory::ConversationStore;
    use crate::npc::agent::AgentSpec;
    use crate::npc::behavior::BehaviorConfig;
    use crate::npc::world::InMemoryWorld;
    use crate::observability::PerformanceCounters;
    use std::time::Duration;

    struct Fixture {
        executor: Arc<DecisionExecutor>,
        world: Arc<InMemoryWorld>,
        client: Arc<MockLlmClient>,
    }

    fn fixture(client: MockLlmClient) -> Fixture {
        let clock = MonotonicClock::new();
        let counters = Arc::new(PerformanceCounters::new());
        let client = Arc::new(client);
        let endpoint = Endpoint::new(EndpointSpec::new("mock", "m"), client.clone()).unwrap();
        let registry = Arc::new(EndpointRegistry::new(vec![Arc::new(endpoint)], clock));
        let selector = Arc::new(EndpointSelector::new(registry, SelectionPolicy::Single));
        let store = Arc::new(ConversationStore::new(10, clock));
        let dispatcher = Arc::new(RequestDispatcher::new(
            selector,
            store,
            Arc::clone(&counters),
            clock,
            RetryPolicy {
                max_retries: 0,
                backoff: Duration::from_millis(1),
            },
        ));
        let limiter = Arc::new(DecisionLimiter::new(4, clock, Arc::clone(&counters)));
        let ai_pool = Arc::new(WorkerPool::new("ai", 2, 8, OverflowPolicy::DropOldest, counters));
        let world = Arc::new(InMemoryWorld::new());
        let executor = Arc::new(DecisionExecutor::new(
            dispatcher,
            limiter,
            ai_pool,
            world.clone(),
            world.clone(),
            Arc::new(PersonaRegistry::default()),
            clock,
            ExecutorConfig::default(),
        ));
        Fixture {
            executor,
            world,
            client,
        }
    }

    fn spawn(world: &InMemoryWorld, id: &str, behavior: BehaviorConfig) -> Arc<Agent> {
        let spawn = Position::new(0.0, 64.0, 0.0);
        world.place_agent(id, spawn);
        Arc::new(Agent::new(AgentSpec::new(id, spawn).with_behavior(behavior), 0))
    }

    #[tokio::test]
    async fn test_apply_well_formed_decision_sets_target() {
        let f = fixture(MockLlmClient::new());
        let agent = spawn(&f.world, "a", BehaviorConfig::default());
        let outcome = f.executor.apply_decision(
            &agent,
            AgentState::Idle,
            Ok("ACTION:MOVE|DIRECTION:EAST|REASON:go".into()),
        );
        assert_eq!(outcome, ApplyOutcome::Applied(AgentState::MovingTo));
        assert_eq!(agent.target(), Some(Position::new(5.0, 64.0, 0.0)));
        assert_eq!(f.world.visual_state("a"), Some(AgentState::MovingTo));
    }

    #[tokio::test]
    async fn test_malformed_decision_becomes_idle() {
        let f = fixture(MockLlmClient::new());
        let agent = spawn(&f.world, "a", BehaviorConfig::default());
        agent.transition(AgentState::Idle, AgentState::Wandering);
        let outcome = f.executor.apply_decision(
            &agent,
            AgentState::Wandering,
            Ok("I'd rather not say".into()),
        );
        assert_eq!(outcome, ApplyOutcome::Applied(AgentState::Idle));
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn test_dispatch_failure_defaults_to_idle() {
        let f = fixture(MockLlmClient::new());
        let agent = spawn(&f.world, "a", BehaviorConfig::default());
        agent.transition(AgentState::Idle, AgentState::Patrolling);
        let outcome = f.executor.apply_decision(
            &agent,
            AgentState::Patrolling,
            Err(DispatchError::NoServiceAvailable {
                attempts: 1,
                last_error: None,
            }),
        );
        assert_eq!(outcome, ApplyOutcome::Defaulted);
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn test_stale_and_removed_results_are_dropped() {
        let f = fixture(MockLlmClient::new());
        let agent = spawn(&f.world, "a", BehaviorConfig::default());

        f.executor.begin_dialogue(&agent, "steve");
        let outcome = f
            .executor
            .apply_decision(&agent, AgentState::Idle, Ok("ACTION:FLEE".into()));
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(agent.state(), AgentState::Talking);

        agent.mark_removed();
        let outcome = f
            .executor
            .apply_decision(&agent, AgentState::Talking, Ok("ACTION:FLEE".into()));
        assert_eq!(outcome, ApplyOutcome::Discarded);
        assert_eq!(f.executor.stats().decisions_discarded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_decision_round_trip() {
        let f = fixture(MockLlmClient::replying("ACTION:WANDER|DIRECTION:NORTH|REASON:bored"));
        let behavior = BehaviorConfig::builder().decision_interval_ms(1_000).build();
        let agent = spawn(&f.world, "a", behavior);

        // 防抖从登记时刻开始
        assert_eq!(f.executor.request_decision(&agent).await, DecisionRequest::NotDue);
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(f.executor.request_decision(&agent).await, DecisionRequest::Submitted);

        for _ in 0..50 {
            if agent.state() == AgentState::Wandering {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(agent.state(), AgentState::Wandering);
        assert_eq!(agent.target(), Some(Position::new(0.0, 64.0, -5.0)));
        assert_eq!(f.client.calls(), 1);
        assert!(f.client.last_messages().last().unwrap().content.contains("ACTION"));
    }

    #[tokio::test]
    async fn test_skip_decision_while_talking() {
        let f = fixture(MockLlmClient::new());
        let agent = spawn(&f.world, "a", BehaviorConfig::builder().decision_interval_ms(0).build());
        f.executor.begin_dialogue(&agent, "steve");
        assert_eq!(f.executor.request_decision(&agent).await, DecisionRequest::Skipped);
        assert_eq!(f.client.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dialogue_grace_restores_prior_state() {
        let f = fixture(MockLlmClient::new());
        let agent = spawn(&f.world, "a", BehaviorConfig::default());
        f.world.place_observer("steve", Position::new(1.0, 64.0, 0.0));
        agent.transition(AgentState::Idle, AgentState::Patrolling);

        f.executor.begin_dialogue(&agent, "steve");
        f.executor.cheap_update(&agent);
        assert_eq!(agent.state(), AgentState::Talking);

        tokio::time::advance(Duration::from_millis(5_000)).await;
        f.executor.cheap_update(&agent);
        assert_eq!(agent.state(), AgentState::Patrolling);
    }

    #[tokio::test]
    async fn test_observer_left_reverts_to_idle() {
        let f = fixture(MockLlmClient::new());
        let agent = spawn(&f.world, "a", BehaviorConfig::default());
        f.world.place_observer("steve", Position::new(1.0, 64.0, 0.0));
        f.executor.begin_dialogue(&agent, "steve");

        f.world.disconnect_observer("steve");
        f.executor.cheap_update(&agent);
        assert_eq!(agent.state(), AgentState::Idle);
        assert!(agent.counterpart().is_none());
        assert!(agent.talk_grace().is_none());
    }

    #[tokio::test]
    async fn test_sleep_and_wake_by_schedule() {
        let f = fixture(MockLlmClient::new());
        let agent = spawn(&f.world, "a", BehaviorConfig::builder().sleep_at_night(true).build());
        agent.transition(AgentState::Idle, AgentState::Wandering);

        f.world.set_time(15_000);
        f.executor.cheap_update(&agent);
        assert_eq!(agent.state(), AgentState::Sleeping);

        f.world.set_time(1_000);
        f.executor.cheap_update(&agent);
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn test_damage_responses() {
        let f = fixture(MockLlmClient::new());
        let meek = spawn(&f.world, "meek", BehaviorConfig::default());
        let tank = spawn(&f.world, "tank", BehaviorConfig::builder().invulnerable(true).build());
        let brute = spawn(&f.world, "brute", BehaviorConfig::builder().aggressive(true).build());

        assert_eq!(f.executor.on_damaged(&meek, Some("steve")), DamageResponse::Flee);
        assert_eq!(meek.state(), AgentState::Fleeing);
        assert_eq!(meek.counterpart().as_deref(), Some("steve"));
        assert_eq!(f.executor.on_damaged(&tank, None), DamageResponse::Cancel);
        assert_eq!(f.executor.on_damaged(&brute, None), DamageResponse::Ignore);
        assert_eq!(brute.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn test_move_to_reaches_target_then_idles() {
        let f = fixture(MockLlmClient::new());
        let agent = spawn(&f.world, "a", BehaviorConfig::builder().movement_speed(1.0).build());
        agent.transition(AgentState::Idle, AgentState::MovingTo);
        agent.set_target(Some(Position::new(3.0, 64.0, 0.0)));

        for _ in 0..5 {
            f.executor.execute_behavior(&agent);
        }
        assert_eq!(agent.state(), AgentState::Idle);
        assert!(agent.target().is_none());
        let pos = f.world.current_position("a").unwrap();
        assert!(pos.distance(&Position::new(3.0, 64.0, 0.0)) < 1.0);
    }

    #[tokio::test]
    async fn test_flee_moves_away_from_observer() {
        let f = fixture(MockLlmClient::new());
        let agent = spawn(&f.world, "a", BehaviorConfig::default());
        f.world.place_observer("steve", Position::new(-2.0, 64.0, 0.0));
        agent.force_state(AgentState::Fleeing);

        f.executor.execute_behavior(&agent);
        assert!(agent.position().x > 0.0);

        f.world.disconnect_observer("steve");
        f.executor.execute_behavior(&agent);
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[tokio::test]
    async fn test_wander_stays_within_radius() {
        let f = fixture(MockLlmClient::new());
        let agent = spawn(&f.world, "a", BehaviorConfig::builder().wander_radius(4.0).build());
        agent.force_state(AgentState::Wandering);
        for _ in 0..100 {
            f.executor.execute_behavior(&agent);
            let target = agent.target().unwrap();
            assert!((target.x).abs() <= 4.0 && (target.z).abs() <= 4.0);
        }
    }
}
