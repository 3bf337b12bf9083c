//! 宿主世界接缝
//!
//! - WorldView：只读查询（位置、附近观察者、在线状态、世界时间）
//! - MovementSink：发往宿主主循环的移动/外观指令，fire-and-forget
//!
//! ChannelSink 把指令投递到 mpsc 队列，由宿主 tick 循环统一应用；AI/网络工作从不在宿主循环上执行。
//! InMemoryWorld 同时实现两个接缝，供演示二进制与测试使用。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::agent::AgentState;

/// 三维坐标
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Position) -> f64 {
        self.sub(other).length()
    }

    pub fn add(&self, other: &Position) -> Position {
        Position::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    pub fn sub(&self, other: &Position) -> Position {
        Position::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    pub fn scale(&self, factor: f64) -> Position {
        Position::new(self.x * factor, self.y * factor, self.z * factor)
    }

    pub fn length(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// 单位向量；零向量保持为零
    pub fn normalized(&self) -> Position {
        let len = self.length();
        if len <= f64::EPSILON {
            Position::default()
        } else {
            self.scale(1.0 / len)
        }
    }
}

/// 附近的观察者（玩家）
#[derive(Debug, Clone, PartialEq)]
pub struct Observer {
    pub id: String,
    pub position: Position,
}

/// 世界只读查询
pub trait WorldView: Send + Sync {
    fn current_position(&self, agent_id: &str) -> Option<Position>;

    /// range 内的在线观察者，按距离升序
    fn nearby_observers(&self, agent_id: &str, range: f64) -> Vec<Observer>;

    fn observer_position(&self, observer_id: &str) -> Option<Position>;

    fn observer_online(&self, observer_id: &str) -> bool;

    /// 世界时间（tick，0..24000 循环）
    fn world_time_of_day(&self) -> u64;
}

/// 移动 / 外观 / 生成指令出口
pub trait MovementSink: Send + Sync {
    fn spawn_entity(&self, agent_id: &str, position: Position);

    fn despawn_entity(&self, agent_id: &str);

    fn teleport_towards(&self, agent_id: &str, position: Position);

    fn set_visual_state(&self, agent_id: &str, state: AgentState);
}

/// 投递给宿主主循环的指令
#[derive(Debug, Clone, PartialEq)]
pub enum HostCommand {
    Spawn { agent_id: String, position: Position },
    Despawn { agent_id: String },
    Teleport { agent_id: String, position: Position },
    VisualState { agent_id: String, state: AgentState },
}

/// 通过有界 mpsc 投递指令；队列满时丢弃并记 debug 日志
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<HostCommand>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<HostCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    fn send(&self, cmd: HostCommand) {
        if let Err(e) = self.tx.try_send(cmd) {
            tracing::debug!("host command dropped: {}", e);
        }
    }
}

impl MovementSink for ChannelSink {
    fn spawn_entity(&self, agent_id: &str, position: Position) {
        self.send(HostCommand::Spawn {
            agent_id: agent_id.to_string(),
            position,
        });
    }

    fn despawn_entity(&self, agent_id: &str) {
        self.send(HostCommand::Despawn {
            agent_id: agent_id.to_string(),
        });
    }

    fn teleport_towards(&self, agent_id: &str, position: Position) {
        self.send(HostCommand::Teleport {
            agent_id: agent_id.to_string(),
            position,
        });
    }

    fn set_visual_state(&self, agent_id: &str, state: AgentState) {
        self.send(HostCommand::VisualState {
            agent_id: agent_id.to_string(),
            state,
        });
    }
}

#[derive(Debug, Clone)]
struct ObserverEntry {
    position: Position,
    online: bool,
}

/// 内存世界：Agent 与观察者的位置表 + 世界时间
#[derive(Debug, Default)]
pub struct InMemoryWorld {
    agents: RwLock<HashMap<String, Position>>,
    visual: RwLock<HashMap<String, AgentState>>,
    observers: RwLock<HashMap<String, ObserverEntry>>,
    time: AtomicU64,
}

impl InMemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn place_agent(&self, agent_id: &str, position: Position) {
        self.agents
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(agent_id.to_string(), position);
    }

    pub fn remove_agent(&self, agent_id: &str) {
        self.agents
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(agent_id);
        self.visual
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(agent_id);
    }

    pub fn place_observer(&self, observer_id: &str, position: Position) {
        self.observers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(
                observer_id.to_string(),
                ObserverEntry {
                    position,
                    online: true,
                },
            );
    }

    /// 观察者下线（保留最后位置）
    pub fn disconnect_observer(&self, observer_id: &str) {
        if let Some(entry) = self
            .observers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(observer_id)
        {
            entry.online = false;
        }
    }

    pub fn set_time(&self, world_time: u64) {
        self.time.store(world_time % 24_000, Ordering::Relaxed);
    }

    /// 推进世界时间
    pub fn advance_time(&self, ticks: u64) {
        let _ = self
            .time
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |t| {
                Some((t + ticks) % 24_000)
            });
    }

    pub fn visual_state(&self, agent_id: &str) -> Option<AgentState> {
        self.visual
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(agent_id)
            .copied()
    }

    /// 宿主主循环应用一条指令
    pub fn apply(&self, cmd: HostCommand) {
        match cmd {
            HostCommand::Spawn { agent_id, position } => self.place_agent(&agent_id, position),
            HostCommand::Despawn { agent_id } => self.remove_agent(&agent_id),
            HostCommand::Teleport { agent_id, position } => {
                let mut agents = self.agents.write().unwrap_or_else(|p| p.into_inner());
                // 已移除的 Agent 不复活
                if let Some(current) = agents.get_mut(&agent_id) {
                    *current = position;
                }
            }
            HostCommand::VisualState { agent_id, state } => {
                self.visual
                    .write()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(agent_id, state);
            }
        }
    }
}

impl WorldView for InMemoryWorld {
    fn current_position(&self, agent_id: &str) -> Option<Position> {
        self.agents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(agent_id)
            .copied()
    }

    fn nearby_observers(&self, agent_id: &str, range: f64) -> Vec<Observer> {
        let Some(origin) = self.current_position(agent_id) else {
            return Vec::new();
        };
        let observers = self.observers.read().unwrap_or_else(|p| p.into_inner());
        let mut nearby: Vec<(f64, Observer)> = observers
            .iter()
            .filter(|(_, o)| o.online)
            .map(|(id, o)| (origin.distance(&o.position), id, o))
            .filter(|(d, _, _)| *d <= range)
            .map(|(d, id, o)| {
                (
                    d,
                    Observer {
                        id: id.clone(),
                        position: o.position,
                    },
                )
            })
            .collect();
        nearby.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        nearby.into_iter().map(|(_, o)| o).collect()
    }

    fn observer_position(&self, observer_id: &str) -> Option<Position> {
        self.observers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(observer_id)
            .map(|o| o.position)
    }

    fn observer_online(&self, observer_id: &str) -> bool {
        self.observers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(observer_id)
            .map(|o| o.online)
            .unwrap_or(false)
    }

    fn world_time_of_day(&self) -> u64 {
        self.time.load(Ordering::Relaxed)
    }
}

/// 直接应用（无宿主循环时使用，例如测试）
impl MovementSink for InMemoryWorld {
    fn spawn_entity(&self, agent_id: &str, position: Position) {
        self.apply(HostCommand::Spawn {
            agent_id: agent_id.to_string(),
            position,
        });
    }

    fn despawn_entity(&self, agent_id: &str) {
        self.apply(HostCommand::Despawn {
            agent_id: agent_id.to_string(),
        });
    }

    fn teleport_towards(&self, agent_id: &str, position: Position) {
        self.apply(HostCommand::Teleport {
            agent_id: agent_id.to_string(),
            position,
        });
    }

    fn set_visual_state(&self, agent_id: &str, state: AgentState) {
        self.apply(HostCommand::VisualState {
            agent_id: agent_id.to_string(),
            state,
        });
    }
}

/// 宿主主循环：串行应用指令直到取消或发送端全部关闭
pub async fn run_host_loop(
    world: Arc<InMemoryWorld>,
    mut rx: mpsc::Receiver<HostCommand>,
    cancel: CancellationToken,
) -> u64 {
    let mut applied = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(cmd) => {
                    world.apply(cmd);
                    applied += 1;
                }
                None => break,
            },
        }
    }
    tracing::debug!(applied, "host loop stopped");
    applied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_math() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert_eq!(a.distance(&b), 5.0);
        let n = b.normalized();
        assert!((n.length() - 1.0).abs() < 1e-9);
        assert_eq!(Position::default().normalized(), Position::default());
    }

    #[test]
    fn test_nearby_observers_sorted_and_online_only() {
        let world = InMemoryWorld::new();
        world.place_agent("npc", Position::new(0.0, 64.0, 0.0));
        world.place_observer("far", Position::new(50.0, 64.0, 0.0));
        world.place_observer("mid", Position::new(10.0, 64.0, 0.0));
        world.place_observer("near", Position::new(2.0, 64.0, 0.0));

        let ids: Vec<_> = world
            .nearby_observers("npc", 20.0)
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids, vec!["near", "mid"]);

        world.disconnect_observer("near");
        assert!(!world.observer_online("near"));
        assert_eq!(world.nearby_observers("npc", 20.0).len(), 1);
        assert!(world.nearby_observers("ghost", 20.0).is_empty());
    }

    #[test]
    fn test_teleport_does_not_resurrect() {
        let world = InMemoryWorld::new();
        world.place_agent("a", Position::default());
        world.teleport_towards("a", Position::new(1.0, 0.0, 0.0));
        assert_eq!(world.current_position("a"), Some(Position::new(1.0, 0.0, 0.0)));
        world.remove_agent("a");
        world.teleport_towards("a", Position::new(2.0, 0.0, 0.0));
        assert_eq!(world.current_position("a"), None);
    }

    #[test]
    fn test_time_wraps() {
        let world = InMemoryWorld::new();
        world.set_time(23_500);
        world.advance_time(1_000);
        assert_eq!(world.world_time_of_day(), 500);
    }

    #[tokio::test]
    async fn test_channel_sink_feeds_host_loop() {
        let world = Arc::new(InMemoryWorld::new());
        world.place_agent("a", Position::default());
        let (sink, rx) = ChannelSink::new(8);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_host_loop(Arc::clone(&world), rx, cancel.clone()));

        sink.teleport_towards("a", Position::new(0.0, 1.0, 0.0));
        sink.set_visual_state("a", AgentState::Wandering);
        sink.spawn_entity("b", Position::new(5.0, 64.0, 5.0));
        sink.despawn_entity("b");
        drop(sink);

        assert_eq!(handle.await.unwrap(), 4);
        assert_eq!(world.current_position("b"), None);
        assert_eq!(world.current_position("a"), Some(Position::new(0.0, 1.0, 0.0)));
        assert_eq!(world.visual_state("a"), Some(AgentState::Wandering));
    }
}
