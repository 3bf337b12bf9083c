//! 人设：作为 system 消息前置到对话中的上下文
//!
//! 由 [personas.<key>] 配置段加载；玩家未选择时使用 `default`。

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

pub const DEFAULT_PERSONA: &str = "default";

/// 单个人设
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub context: String,
}

impl Persona {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            context: context.into(),
        }
    }
}

/// 人设注册表 + 每个玩家的当前选择
#[derive(Debug, Default)]
pub struct PersonaRegistry {
    personas: BTreeMap<String, Arc<Persona>>,
    selections: RwLock<HashMap<String, String>>,
}

impl PersonaRegistry {
    pub fn new(personas: BTreeMap<String, Persona>) -> Self {
        Self {
            personas: personas
                .into_iter()
                .map(|(key, p)| (key, Arc::new(p)))
                .collect(),
            selections: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Persona>> {
        self.personas.get(key).cloned()
    }

    /// 可选人设 key（有序）
    pub fn keys(&self) -> Vec<String> {
        self.personas.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.personas.contains_key(key)
    }

    /// 玩家当前人设；未选择时回退 default，default 也不存在则为 None
    pub fn current_for(&self, player_id: &str) -> Option<Arc<Persona>> {
        let selected = self
            .selections
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(player_id)
            .cloned();
        selected
            .and_then(|key| self.get(&key))
            .or_else(|| self.get(DEFAULT_PERSONA))
    }

    /// 切换人设；返回是否与之前不同（调用方据此清空该玩家会话）
    pub fn select(&self, player_id: &str, key: &str) -> Option<bool> {
        if !self.contains(key) {
            return None;
        }
        let mut selections = self.selections.write().unwrap_or_else(|p| p.into_inner());
        let previous = selections.insert(player_id.to_string(), key.to_string());
        Some(previous.as_deref() != Some(key))
    }

    pub fn forget_player(&self, player_id: &str) {
        self.selections
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(player_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PersonaRegistry {
        let mut personas = BTreeMap::new();
        personas.insert(
            "default".to_string(),
            Persona::new("Guide", "helpful", "You are a helpful guide."),
        );
        personas.insert(
            "pirate".to_string(),
            Persona::new("Pirate", "salty", "You speak like a pirate."),
        );
        PersonaRegistry::new(personas)
    }

    #[test]
    fn test_default_fallback() {
        let reg = registry();
        assert_eq!(reg.current_for("steve").unwrap().name, "Guide");
    }

    #[test]
    fn test_select_and_switch() {
        let reg = registry();
        assert_eq!(reg.select("steve", "pirate"), Some(true));
        assert_eq!(reg.select("steve", "pirate"), Some(false));
        assert_eq!(reg.current_for("steve").unwrap().name, "Pirate");
        assert_eq!(reg.select("steve", "ninja"), None);

        reg.forget_player("steve");
        assert_eq!(reg.current_for("steve").unwrap().name, "Guide");
        assert_eq!(reg.keys(), vec!["default", "pirate"]);
    }

    #[test]
    fn test_no_default_means_none() {
        let reg = PersonaRegistry::new(BTreeMap::new());
        assert!(reg.current_for("x").is_none());
    }
}
