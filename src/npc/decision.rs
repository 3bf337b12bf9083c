//! 决策文本解析与提示词
//!
//! 响应格式：`ACTION:<行为>|DIRECTION:<方向>|REASON:<原因>`，键大小写不敏感，顺序不限。
//! 无法识别的行为一律解析为 Idle，无法识别的方向视为 STAY；解析本身从不失败。

use super::agent::{Agent, AgentState};
use super::behavior::{time_of_day_label, BehaviorConfig};
use super::world::{Observer, Position};
use crate::memory::{Message, Role};

/// 方向偏移的步长
pub const MOVE_DISTANCE: f64 = 5.0;
const DIAGONAL: f64 = 0.7;

/// 移动方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    North,
    South,
    East,
    West,
    NorthEast,
    NorthWest,
    SouthEast,
    SouthWest,
    Up,
    Down,
    Stay,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace(['_', '-', ' '], "");
        Some(match normalized.as_str() {
            "NORTH" | "N" => Self::North,
            "SOUTH" | "S" => Self::South,
            "EAST" | "E" => Self::East,
            "WEST" | "W" => Self::West,
            "NORTHEAST" | "NE" => Self::NorthEast,
            "NORTHWEST" | "NW" => Self::NorthWest,
            "SOUTHEAST" | "SE" => Self::SouthEast,
            "SOUTHWEST" | "SW" => Self::SouthWest,
            "UP" => Self::Up,
            "DOWN" => Self::Down,
            "STAY" | "NONE" => Self::Stay,
            _ => return None,
        })
    }

    /// 相对偏移；北为 -z，东为 +x
    pub fn offset(self) -> Option<Position> {
        let d = MOVE_DISTANCE;
        let k = d * DIAGONAL;
        Some(match self {
            Self::North => Position::new(0.0, 0.0, -d),
            Self::South => Position::new(0.0, 0.0, d),
            Self::East => Position::new(d, 0.0, 0.0),
            Self::West => Position::new(-d, 0.0, 0.0),
            Self::NorthEast => Position::new(k, 0.0, -k),
            Self::NorthWest => Position::new(-k, 0.0, -k),
            Self::SouthEast => Position::new(k, 0.0, k),
            Self::SouthWest => Position::new(-k, 0.0, k),
            Self::Up => Position::new(0.0, d, 0.0),
            Self::Down => Position::new(0.0, -d, 0.0),
            Self::Stay => return None,
        })
    }
}

/// 把 ACTION 值映射为状态（接受动词形式与别名）
pub fn parse_action(s: &str) -> Option<AgentState> {
    let normalized = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
    Some(match normalized.as_str() {
        "IDLE" => AgentState::Idle,
        "WANDER" | "WANDERING" | "EXPLORE" | "EXPLORING" => AgentState::Wandering,
        "FOLLOW" | "FOLLOWING" => AgentState::Following,
        "TALK" | "TALKING" => AgentState::Talking,
        "MOVE" | "MOVE_TO" | "MOVING_TO" | "MOVINGTO" => AgentState::MovingTo,
        "FLEE" | "FLEEING" => AgentState::Fleeing,
        "PATROL" | "PATROLLING" => AgentState::Patrolling,
        "SLEEP" | "SLEEPING" | "REST" => AgentState::Sleeping,
        _ => return None,
    })
}

/// 解析后的决策
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: AgentState,
    pub direction: Direction,
    pub reason: String,
    /// ACTION 字段存在且可识别
    pub well_formed: bool,
}

impl Default for Decision {
    fn default() -> Self {
        Self {
            action: AgentState::Idle,
            direction: Direction::Stay,
            reason: String::new(),
            well_formed: false,
        }
    }
}

impl Decision {
    pub fn parse(text: &str) -> Self {
        let mut decision = Decision::default();
        // 模型偶尔会在决策行前后加说明文字，取第一行含 ACTION 的内容
        let line = text
            .lines()
            .find(|l| l.to_ascii_uppercase().contains("ACTION"))
            .unwrap_or(text);

        for part in line.split('|') {
            let Some((key, value)) = part.split_once(':') else {
                continue;
            };
            let key = key.trim().trim_matches(|c: char| !c.is_ascii_alphabetic());
            match key.to_ascii_uppercase().as_str() {
                "ACTION" => {
                    if let Some(action) = parse_action(value) {
                        decision.action = action;
                        decision.well_formed = true;
                    }
                }
                "DIRECTION" => {
                    decision.direction = Direction::parse(value).unwrap_or(Direction::Stay);
                }
                "REASON" => decision.reason = value.trim().to_string(),
                _ => {}
            }
        }
        decision
    }
}

/// 世界高度范围
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldBounds {
    pub min_y: f64,
    pub max_y: f64,
}

impl Default for WorldBounds {
    fn default() -> Self {
        Self {
            min_y: 0.0,
            max_y: 256.0,
        }
    }
}

/// 目标需在出生点的游荡半径内且在世界高度范围内
pub fn is_valid_target(spawn: &Position, target: &Position, wander_radius: f64, bounds: WorldBounds) -> bool {
    spawn.distance(target) <= wander_radius && target.y >= bounds.min_y && target.y <= bounds.max_y
}

/// 由当前位置与方向得到有效目标
pub fn resolve_target(
    current: &Position,
    spawn: &Position,
    direction: Direction,
    behavior: &BehaviorConfig,
    bounds: WorldBounds,
) -> Option<Position> {
    let target = current.add(&direction.offset()?);
    is_valid_target(spawn, &target, behavior.wander_radius, bounds).then_some(target)
}

/// 移动决策提示词
pub fn decision_prompt(agent: &Agent, observers: &[Observer], world_time: u64) -> String {
    let pos = agent.position();
    let behavior = agent.behavior();
    let nearby = if observers.is_empty() {
        "none".to_string()
    } else {
        observers
            .iter()
            .map(|o| o.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let preferences = ["idle", "wander", "follow", "flee", "patrol", "sleep"]
        .iter()
        .map(|b| format!("{b}={:.1}", behavior.weight(b)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "You are {name}, an autonomous character in a shared world.\n\
         Current state:\n\
         - position: {x:.1}, {y:.1}, {z:.1}\n\
         - state: {state}\n\
         - nearby players: {nearby}\n\
         - time of day: {time}\n\
         - behavior preferences: {preferences}\n\
         \n\
         Choose one action: IDLE, WANDER, FOLLOW, FLEE, EXPLORE, PATROL, SLEEP.\n\
         Choose one direction: NORTH, SOUTH, EAST, WEST, NORTHEAST, NORTHWEST, SOUTHEAST, SOUTHWEST, UP, DOWN, STAY.\n\
         Reply with exactly one line in the format ACTION:<action>|DIRECTION:<direction>|REASON:<reason>\n\
         Example: ACTION:WANDER|DIRECTION:NORTH|REASON:I want to see what is over there",
        name = agent.display_name(),
        x = pos.x,
        y = pos.y,
        z = pos.z,
        state = agent.state(),
        time = time_of_day_label(world_time),
    )
}

/// 与玩家对话的提示词：内联最近的对话记录
pub fn dialogue_prompt(
    agent: &Agent,
    observer_id: &str,
    message: &str,
    history: &[Message],
    world_time: u64,
) -> String {
    let transcript = if history.is_empty() {
        "(none)".to_string()
    } else {
        history
            .iter()
            .map(|m| match m.role {
                Role::User => format!("{observer_id}: {}", m.content),
                Role::Assistant => format!("{}: {}", agent.display_name(), m.content),
                Role::System => m.content.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let pos = agent.position();
    format!(
        "You are {name}, a character in a shared world.\n\
         Player {observer_id} says: \"{message}\"\n\
         \n\
         Conversation so far:\n{transcript}\n\
         \n\
         Surroundings: position {x:.1}, {y:.1}, {z:.1}; time of day: {time}.\n\
         Stay in character and answer naturally in one to three sentences.",
        name = agent.display_name(),
        x = pos.x,
        y = pos.y,
        z = pos.z,
        time = time_of_day_label(world_time),
    )
}
