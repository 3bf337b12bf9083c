//! Agent 与 Agent 注册表
//!
//! 状态存为 AtomicU8，所有转移都走 compare_exchange：决策结果只在状态仍等于发起时观察到的值时才生效。
//! 位置 / 目标 / 交互对象放在一把短临界区的 Mutex 里；按对象划分的对话记忆各自独立。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;

use super::behavior::BehaviorConfig;
use super::world::Position;
use crate::memory::{ConversationMemory, Message};

/// Agent 状态（闭集）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum AgentState {
    Idle = 0,
    Wandering = 1,
    Following = 2,
    Talking = 3,
    MovingTo = 4,
    Fleeing = 5,
    Patrolling = 6,
    Sleeping = 7,
}

impl AgentState {
    pub const ALL: [AgentState; 8] = [
        Self::Idle,
        Self::Wandering,
        Self::Following,
        Self::Talking,
        Self::MovingTo,
        Self::Fleeing,
        Self::Patrolling,
        Self::Sleeping,
    ];

    fn from_u8(v: u8) -> Self {
        Self::ALL.get(v as usize).copied().unwrap_or(Self::Idle)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Wandering => "WANDERING",
            Self::Following => "FOLLOWING",
            Self::Talking => "TALKING",
            Self::MovingTo => "MOVING_TO",
            Self::Fleeing => "FLEEING",
            Self::Patrolling => "PATROLLING",
            Self::Sleeping => "SLEEPING",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 生成 Agent 所需的定义
#[derive(Debug, Clone)]
pub struct AgentSpec {
    pub id: String,
    pub display_name: String,
    /// 人设 key
    pub persona: Option<String>,
    pub spawn: Position,
    pub behavior: BehaviorConfig,
}

impl AgentSpec {
    pub fn new(id: impl Into<String>, spawn: Position) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            persona: None,
            spawn,
            behavior: BehaviorConfig::default(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    pub fn with_behavior(mut self, behavior: BehaviorConfig) -> Self {
        self.behavior = behavior;
        self
    }
}

/// 对话被打断前的状态（Talking 宽限期结束后恢复）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TalkGrace {
    pub prior: AgentState,
    pub until_ms: u64,
}

#[derive(Debug)]
struct Motion {
    position: Position,
    target: Option<Position>,
    counterpart: Option<String>,
    talk: Option<TalkGrace>,
    follow_since_ms: Option<u64>,
}

#[derive(Debug)]
struct CounterpartMemory {
    memory: ConversationMemory,
    last_used_ms: u64,
}

/// 单个 Agent
#[derive(Debug)]
pub struct Agent {
    id: String,
    display_name: String,
    persona: Option<String>,
    spawn: Position,
    behavior: RwLock<Arc<BehaviorConfig>>,
    state: AtomicU8,
    alive: AtomicBool,
    last_active_ms: AtomicU64,
    motion: Mutex<Motion>,
    conversations: Mutex<HashMap<String, CounterpartMemory>>,
}

/// 管理面：Agent 快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub display_name: String,
    pub state: AgentState,
    pub position: Position,
    pub target: Option<Position>,
    pub counterpart: Option<String>,
    pub conversations: usize,
    pub in_flight: bool,
}

impl Agent {
    pub fn new(spec: AgentSpec, now_ms: u64) -> Self {
        Self {
            id: spec.id,
            display_name: spec.display_name,
            persona: spec.persona,
            spawn: spec.spawn,
            behavior: RwLock::new(Arc::new(spec.behavior)),
            state: AtomicU8::new(AgentState::Idle as u8),
            alive: AtomicBool::new(true),
            last_active_ms: AtomicU64::new(now_ms),
            motion: Mutex::new(Motion {
                position: spec.spawn,
                target: None,
                counterpart: None,
                talk: None,
                follow_since_ms: None,
            }),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    fn motion(&self) -> MutexGuard<'_, Motion> {
        self.motion.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn conversations(&self) -> MutexGuard<'_, HashMap<String, CounterpartMemory>> {
        self.conversations.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn persona(&self) -> Option<&str> {
        self.persona.as_deref()
    }

    pub fn spawn(&self) -> Position {
        self.spawn
    }

    pub fn behavior(&self) -> Arc<BehaviorConfig> {
        Arc::clone(&self.behavior.read().unwrap_or_else(|p| p.into_inner()))
    }

    /// 替换行为配置（整体换引用）
    pub fn replace_behavior(&self, behavior: BehaviorConfig) {
        *self.behavior.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(behavior);
    }

    // ---- 状态 ----

    pub fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 仅当当前状态为 `from` 时切换到 `to`
    pub fn transition(&self, from: AgentState, to: AgentState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 无条件切换，返回之前的状态（环境事件使用）
    pub fn force_state(&self, to: AgentState) -> AgentState {
        AgentState::from_u8(self.state.swap(to as u8, Ordering::AcqRel))
    }

    // ---- 生命周期 ----

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn mark_removed(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_active_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_active_ms(&self) -> u64 {
        self.last_active_ms.load(Ordering::Relaxed)
    }

    // ---- 位置与目标 ----

    pub fn position(&self) -> Position {
        self.motion().position
    }

    pub fn set_position(&self, position: Position) {
        self.motion().position = position;
    }

    pub fn target(&self) -> Option<Position> {
        self.motion().target
    }

    pub fn set_target(&self, target: Option<Position>) {
        self.motion().target = target;
    }

    pub fn counterpart(&self) -> Option<String> {
        self.motion().counterpart.clone()
    }

    pub fn set_counterpart(&self, counterpart: Option<String>, now_ms: u64) {
        let mut motion = self.motion();
        motion.follow_since_ms = counterpart.as_ref().map(|_| now_ms);
        motion.counterpart = counterpart;
    }

    /// 开始跟随 counterpart 的时间
    pub fn follow_since_ms(&self) -> Option<u64> {
        self.motion().follow_since_ms
    }

    /// 清除交互对象；若当前对象是 `who` 才清除（None 表示无条件）
    pub fn clear_counterpart(&self, who: Option<&str>) -> bool {
        let mut motion = self.motion();
        let matches = match (who, motion.counterpart.as_deref()) {
            (None, _) => true,
            (Some(w), Some(c)) => w == c,
            (Some(_), None) => false,
        };
        if matches {
            motion.counterpart = None;
            motion.follow_since_ms = None;
        }
        matches
    }

    // ---- 对话宽限 ----

    /// 进入 Talking：记录之前的状态（已在 Talking 时保留原来的 prior）并设置宽限截止
    ///
    /// 状态切换与宽限记录在同一把 motion 锁内完成，持锁读取的一方看不到没有宽限的 Talking。
    pub fn begin_talk(&self, counterpart: &str, until_ms: u64, now_ms: u64) -> AgentState {
        let mut motion = self.motion();
        let previous = self.force_state(AgentState::Talking);
        let prior = match (previous, motion.talk) {
            (AgentState::Talking, Some(grace)) => grace.prior,
            (AgentState::Talking, None) => AgentState::Idle,
            (other, _) => other,
        };
        motion.talk = Some(TalkGrace { prior, until_ms });
        motion.counterpart = Some(counterpart.to_string());
        motion.follow_since_ms = Some(now_ms);
        previous
    }

    pub fn talk_grace(&self) -> Option<TalkGrace> {
        self.motion().talk
    }

    /// 一致地读取 (状态, 宽限)
    pub fn talk_view(&self) -> (AgentState, Option<TalkGrace>) {
        let motion = self.motion();
        (self.state(), motion.talk)
    }

    /// 延长宽限期
    pub fn extend_talk(&self, until_ms: u64) {
        if let Some(grace) = self.motion().talk.as_mut() {
            grace.until_ms = grace.until_ms.max(until_ms);
        }
    }

    /// 对话被打断：仅当仍在 Talking 时切到 `to`，丢弃宽限记录，不恢复之前的状态
    pub fn abandon_talk(&self, to: AgentState) -> bool {
        let mut motion = self.motion();
        if !self.transition(AgentState::Talking, to) {
            return false;
        }
        motion.talk = None;
        true
    }

    /// 无条件切到 `to` 并丢弃宽限记录（受到攻击等），返回之前的状态
    pub fn interrupt(&self, to: AgentState) -> AgentState {
        let mut motion = self.motion();
        motion.talk = None;
        self.force_state(to)
    }

    /// 结束 Talking 并恢复之前的状态；不在 Talking 时返回 None
    pub fn end_talk(&self) -> Option<AgentState> {
        let mut motion = self.motion();
        let grace = motion.talk.take()?;
        let restore = if grace.prior == AgentState::Talking {
            AgentState::Idle
        } else {
            grace.prior
        };
        if self.transition(AgentState::Talking, restore) {
            motion.counterpart = None;
            motion.follow_since_ms = None;
            Some(restore)
        } else {
            None
        }
    }

    // ---- 对话记忆 ----

    /// 记录与某个对象的一轮对话（上限由行为配置决定）
    pub fn record_exchange(&self, counterpart: &str, user: &str, reply: &str, now_ms: u64) {
        let cap = self.behavior().max_conversation_history;
        let mut conversations = self.conversations();
        let entry = conversations
            .entry(counterpart.to_string())
            .or_insert_with(|| CounterpartMemory {
                memory: ConversationMemory::new(cap),
                last_used_ms: now_ms,
            });
        entry.memory.push_exchange(user, reply);
        entry.last_used_ms = now_ms;
    }

    pub fn conversation_with(&self, counterpart: &str) -> Vec<Message> {
        self.conversations()
            .get(counterpart)
            .map(|c| c.memory.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations().len()
    }

    pub fn forget_counterpart(&self, counterpart: &str) -> bool {
        self.conversations().remove(counterpart).is_some()
    }

    /// 淘汰空闲对话，返回被淘汰的对象 id
    pub fn evict_idle_conversations(&self, now_ms: u64, idle_ms: u64) -> Vec<String> {
        let mut conversations = self.conversations();
        let stale: Vec<String> = conversations
            .iter()
            .filter(|(_, c)| now_ms.saturating_sub(c.last_used_ms) > idle_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            conversations.remove(id);
        }
        stale
    }

    pub fn clear_conversations(&self) {
        self.conversations().clear();
    }

    pub fn snapshot(&self, in_flight: bool) -> AgentSnapshot {
        let (state, position, target, counterpart) = {
            let motion = self.motion();
            (self.state(), motion.position, motion.target, motion.counterpart.clone())
        };
        AgentSnapshot {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            state,
            position,
            target,
            counterpart,
            conversations: self.conversation_count(),
            in_flight,
        }
    }
}

/// 存活 Agent 的并发注册表
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入；同 id 已存在时返回 false 且不替换
    pub fn insert(&self, agent: Arc<Agent>) -> bool {
        let mut agents = self.agents.write().unwrap_or_else(|p| p.into_inner());
        if agents.contains_key(agent.id()) {
            return false;
        }
        agents.insert(agent.id().to_string(), agent);
        true
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Agent>> {
        let removed = self
            .agents
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
        if let Some(agent) = &removed {
            agent.mark_removed();
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(id)
    }

    /// 快照（按 id 排序，保证调度顺序稳定）
    pub fn all(&self) -> Vec<Arc<Agent>> {
        let mut agents: Vec<_> = self
            .agents
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.id().cmp(b.id()));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 移除全部，返回被移除的 Agent
    pub fn drain(&self) -> Vec<Arc<Agent>> {
        let drained: Vec<_> = self
            .agents
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .map(|(_, a)| a)
            .collect();
        for agent in &drained {
            agent.mark_removed();
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> Agent {
        Agent::new(
            AgentSpec::new("bob", Position::new(0.0, 64.0, 0.0)).with_display_name("Bob"),
            0,
        )
    }

    #[test]
    fn test_initial_state_and_cas() {
        let a = agent();
        assert_eq!(a.state(), AgentState::Idle);
        assert!(a.transition(AgentState::Idle, AgentState::Wandering));
        assert!(!a.transition(AgentState::Idle, AgentState::Fleeing));
        assert_eq!(a.state(), AgentState::Wandering);
        assert_eq!(a.force_state(AgentState::Sleeping), AgentState::Wandering);
    }

    #[test]
    fn test_state_roundtrip_through_u8() {
        for s in AgentState::ALL {
            assert_eq!(AgentState::from_u8(s as u8), s);
        }
        assert_eq!(AgentState::from_u8(200), AgentState::Idle);
    }

    #[test]
    fn test_talk_restores_prior_state() {
        let a = agent();
        a.transition(AgentState::Idle, AgentState::Patrolling);
        a.begin_talk("steve", 5_000, 0);
        assert_eq!(a.state(), AgentState::Talking);
        assert_eq!(a.counterpart().as_deref(), Some("steve"));

        // 再次开始对话不会覆盖 prior
        a.begin_talk("steve", 6_000, 100);
        assert_eq!(a.talk_grace().unwrap().prior, AgentState::Patrolling);

        assert_eq!(a.end_talk(), Some(AgentState::Patrolling));
        assert_eq!(a.state(), AgentState::Patrolling);
        assert!(a.counterpart().is_none());
        assert_eq!(a.end_talk(), None);
    }

    #[test]
    fn test_talk_transitions_are_seen_whole() {
        let a = Arc::new(agent());
        let writer = {
            let a = Arc::clone(&a);
            std::thread::spawn(move || {
                for i in 0..5_000u64 {
                    a.begin_talk("steve", i + 5_000, i);
                    if i % 3 == 0 {
                        a.interrupt(AgentState::Fleeing);
                        a.force_state(AgentState::Idle);
                    } else {
                        a.end_talk();
                    }
                }
            })
        };
        while !writer.is_finished() {
            let (state, grace) = a.talk_view();
            assert_eq!(state == AgentState::Talking, grace.is_some());
            let snapshot = a.snapshot(false);
            if snapshot.state == AgentState::Talking {
                assert_eq!(snapshot.counterpart.as_deref(), Some("steve"));
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_abandon_talk_only_from_talking() {
        let a = agent();
        assert!(!a.abandon_talk(AgentState::Idle));
        a.begin_talk("steve", 5_000, 0);
        assert!(a.abandon_talk(AgentState::Idle));
        assert_eq!(a.talk_view(), (AgentState::Idle, None));
    }

    #[test]
    fn test_conversation_cap_from_behavior() {
        let a = Agent::new(
            AgentSpec::new("c", Position::default())
                .with_behavior(BehaviorConfig::builder().max_conversation_history(2).build()),
            0,
        );
        for i in 0..5 {
            a.record_exchange("steve", &format!("q{i}"), &format!("a{i}"), i);
        }
        let history = a.conversation_with("steve");
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "q3");
    }

    #[test]
    fn test_evict_idle_conversations() {
        let a = agent();
        a.record_exchange("old", "q", "a", 0);
        a.record_exchange("new", "q", "a", 9_000);
        assert_eq!(a.evict_idle_conversations(10_000, 5_000), vec!["old".to_string()]);
        assert_eq!(a.conversation_count(), 1);
    }

    #[test]
    fn test_registry_insert_remove() {
        let reg = AgentRegistry::new();
        let a = Arc::new(agent());
        assert!(reg.insert(Arc::clone(&a)));
        assert!(!reg.insert(Arc::new(agent())));
        assert_eq!(reg.len(), 1);

        let removed = reg.remove("bob").unwrap();
        assert!(!removed.is_alive());
        assert!(!a.is_alive());
        assert!(reg.is_empty());
    }
}
