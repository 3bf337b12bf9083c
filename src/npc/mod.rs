//! NPC 层：Agent 状态机、行为参数、AI 决策、分层调度与宿主世界接缝

pub mod agent;
pub mod behavior;
pub mod decision;
pub mod executor;
pub mod manager;
pub mod scheduler;
pub mod world;

pub use agent::{Agent, AgentRegistry, AgentSnapshot, AgentSpec, AgentState};
pub use behavior::{BehaviorConfig, BehaviorConfigBuilder};
pub use decision::{Decision, Direction, WorldBounds};
pub use executor::{
    ApplyOutcome, DamageResponse, DecisionExecutor, DecisionRequest, ExecutorConfig, ExecutorStats,
};
pub use manager::{dialogue_conversation_id, NpcManager};
pub use scheduler::{MaintenanceReport, SchedulerConfig, SchedulerStats, TieredScheduler};
pub use world::{
    run_host_loop, ChannelSink, HostCommand, InMemoryWorld, MovementSink, Observer, Position,
    WorldView,
};
