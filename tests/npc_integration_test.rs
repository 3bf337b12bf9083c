//! NPC 集成测试：防抖、并发上限、决策降级、分层调度

use std::sync::Arc;
use std::time::Duration;

use hive::config::AppConfig;
use hive::llm::{Endpoint, EndpointSpec, MockLlmClient};
use hive::npc::{
    AgentSpec, AgentState, BehaviorConfig, DecisionRequest, InMemoryWorld, NpcManager, Position,
    WorldView,
};
use hive::Hive;

struct Fixture {
    hive: Hive,
    world: Arc<InMemoryWorld>,
    client: Arc<MockLlmClient>,
}

impl Fixture {
    fn npc(&self) -> &Arc<NpcManager> {
        self.hive.npc().expect("npc subsystem enabled")
    }
}

fn fixture(client: MockLlmClient, tweak: impl FnOnce(&mut AppConfig)) -> Fixture {
    let mut config = AppConfig::default();
    config.llm.max_retries = 0;
    tweak(&mut config);
    let client = Arc::new(client);
    let endpoint = Endpoint::new(EndpointSpec::new("mock", "m"), client.clone()).unwrap();
    let world = Arc::new(InMemoryWorld::new());
    let hive = Hive::with_endpoints(config, vec![Arc::new(endpoint)], world.clone(), world.clone());
    Fixture { hive, world, client }
}

fn spec(id: &str, x: f64, interval_ms: u64) -> AgentSpec {
    AgentSpec::new(id, Position::new(x, 64.0, 0.0))
        .with_behavior(BehaviorConfig::builder().decision_interval_ms(interval_ms).build())
}

/// 推进虚拟时间直到条件成立
async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[tokio::test(start_paused = true)]
async fn test_decisions_are_debounced_per_agent() {
    let f = fixture(
        MockLlmClient::replying("ACTION:IDLE|DIRECTION:NONE|REASON:resting"),
        |_| {},
    );
    let agent = f.npc().spawn(spec("bob", 0.0, 3_000)).unwrap();
    let executor = f.npc().executor();

    let mut outcomes = Vec::new();
    for _ in 0..6 {
        tokio::time::advance(Duration::from_millis(500)).await;
        outcomes.push(executor.request_decision(&agent).await);
    }
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == DecisionRequest::Submitted)
            .count(),
        1
    );
    assert_eq!(outcomes.last(), Some(&DecisionRequest::Submitted));

    tokio::time::advance(Duration::from_millis(100)).await;
    assert!(wait_until(|| f.client.calls() == 1).await);
    assert_eq!(executor.request_decision(&agent).await, DecisionRequest::NotDue);
}

#[tokio::test(start_paused = true)]
async fn test_global_permits_bound_in_flight_decisions() {
    let f = fixture(
        MockLlmClient::replying("ACTION:WANDER|DIRECTION:NORTH|REASON:bored")
            .with_latency(Duration::from_secs(1)),
        |config| {
            config.npc.max_concurrent_ai_requests = 2;
            config.npc.ai_workers = 2;
        },
    );
    let agents: Vec<_> = (0..5)
        .map(|i| f.npc().spawn(spec(&format!("a{i}"), i as f64, 0)).unwrap())
        .collect();
    let executor = f.npc().executor();

    let mut outcomes = Vec::new();
    for agent in &agents {
        outcomes.push(executor.request_decision(agent).await);
    }
    assert_eq!(
        outcomes,
        vec![
            DecisionRequest::Submitted,
            DecisionRequest::Submitted,
            DecisionRequest::Saturated,
            DecisionRequest::Saturated,
            DecisionRequest::Saturated,
        ]
    );
    assert_eq!(f.npc().limiter().in_flight(), 2);
    assert_eq!(f.hive.counters().dropped_requests, 3);

    // 完成后许可归还
    assert!(wait_until(|| f.npc().limiter().in_flight() == 0).await);
    assert_eq!(f.client.calls(), 2);
    assert_eq!(agents[0].state(), AgentState::Wandering);
    assert_eq!(agents[1].state(), AgentState::Wandering);
    assert_eq!(agents[2].state(), AgentState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_unparsable_reply_falls_back_to_idle() {
    let f = fixture(MockLlmClient::replying("Hmm, let me think about that."), |_| {});
    let agent = f.npc().spawn(spec("mia", 0.0, 0)).unwrap();
    agent.force_state(AgentState::Patrolling);

    assert_eq!(
        f.npc().executor().request_decision(&agent).await,
        DecisionRequest::Submitted
    );
    assert!(wait_until(|| agent.state() == AgentState::Idle).await);
    assert_eq!(f.world.visual_state("mia"), Some(AgentState::Idle));
    assert_eq!(f.npc().executor_stats().decisions_applied, 1);
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_drives_near_agents_only() {
    let f = fixture(
        MockLlmClient::replying("ACTION:MOVE|DIRECTION:EAST|REASON:curious"),
        |config| config.npc.batch_size = 1,
    );
    let near = f.npc().spawn(spec("near", 0.0, 1_000)).unwrap();
    let far = f.npc().spawn(spec("far", 500.0, 1_000)).unwrap();
    f.world.place_observer("steve", Position::new(2.0, 64.0, 0.0));
    tokio::time::advance(Duration::from_millis(1_000)).await;

    let scheduler = f.npc().scheduler();
    assert_eq!(scheduler.active_tick().await, 1);
    assert_eq!(scheduler.inactive_tick(), 1);
    assert!(wait_until(|| near.state() == AgentState::MovingTo).await);
    assert_eq!(near.target(), Some(Position::new(5.0, 64.0, 0.0)));

    // 防抖窗口内只执行移动，不再请求决策
    for _ in 0..3 {
        scheduler.active_tick().await;
        scheduler.inactive_tick();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let moved = f.world.current_position("near").unwrap();
    assert!(moved.x > 0.0 && moved.x < 5.0);

    assert_eq!(f.client.calls(), 1);
    assert_eq!(far.state(), AgentState::Idle);
    assert_eq!(f.world.current_position("far"), Some(Position::new(500.0, 64.0, 0.0)));

    let stats = f.npc().stats();
    assert_eq!(stats.total_agents, 2);
    assert_eq!(stats.current_active, 1);
}
