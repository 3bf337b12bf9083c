//! 会话存储：按会话 ID 管理有界对话历史
//!
//! 外层 RwLock 只保护「ID -> 会话」映射，读多写少；每个会话自带 Mutex，
//! 追加+剪枝在单会话锁内完成，不同会话之间互不阻塞。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::{ConversationMemory, Message};
use crate::core::MonotonicClock;

/// 单个会话条目
#[derive(Debug)]
struct ConversationEntry {
    memory: ConversationMemory,
    /// 最近一次读写（单调毫秒）
    last_used_ms: u64,
}

/// 并发会话存储
pub struct ConversationStore {
    conversations: RwLock<HashMap<String, Arc<Mutex<ConversationEntry>>>>,
    max_turns: usize,
    clock: MonotonicClock,
}

impl ConversationStore {
    pub fn new(max_turns: usize, clock: MonotonicClock) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            max_turns: max_turns.max(1),
            clock,
        }
    }

    async fn entry(&self, id: &str) -> Option<Arc<Mutex<ConversationEntry>>> {
        self.conversations.read().await.get(id).cloned()
    }

    async fn get_or_create(&self, id: &str) -> Arc<Mutex<ConversationEntry>> {
        if let Some(entry) = self.entry(id).await {
            return entry;
        }
        let mut map = self.conversations.write().await;
        map.entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ConversationEntry {
                    memory: ConversationMemory::new(self.max_turns),
                    last_used_ms: self.clock.now_ms(),
                }))
            })
            .clone()
    }

    /// 历史快照：调用方拿到的是副本，重试期间不会看到半途写入
    pub async fn snapshot(&self, id: &str) -> Vec<Message> {
        match self.entry(id).await {
            Some(entry) => entry.lock().await.memory.messages().to_vec(),
            None => Vec::new(),
        }
    }

    /// 追加一轮问答（首次写入时创建会话）
    pub async fn append_exchange(&self, id: &str, user: &str, assistant: &str) {
        let entry = self.get_or_create(id).await;
        let mut guard = entry.lock().await;
        guard.memory.push_exchange(user, assistant);
        guard.last_used_ms = self.clock.now_ms();
    }

    /// 当前会话消息条数
    pub async fn message_count(&self, id: &str) -> usize {
        match self.entry(id).await {
            Some(entry) => entry.lock().await.memory.len(),
            None => 0,
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.conversations.read().await.contains_key(id)
    }

    /// 清除单个会话
    pub async fn clear(&self, id: &str) -> bool {
        self.conversations.write().await.remove(id).is_some()
    }

    /// 清除全部会话，返回清除数量
    pub async fn clear_all(&self) -> usize {
        let mut map = self.conversations.write().await;
        let n = map.len();
        map.clear();
        n
    }

    /// 清除以指定前缀开头的会话（如某个 NPC 的全部对话）
    pub async fn clear_prefix(&self, prefix: &str) -> usize {
        let mut map = self.conversations.write().await;
        let before = map.len();
        map.retain(|id, _| !id.starts_with(prefix));
        before - map.len()
    }

    /// 淘汰 `owned` 选中且超过 idle_ms 未使用的会话；其余会话（如玩家聊天）不受影响
    pub async fn evict_idle_where<F>(&self, idle_ms: u64, owned: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let now = self.clock.now_ms();
        let mut map = self.conversations.write().await;
        let mut stale = Vec::new();
        for (id, entry) in map.iter().filter(|(id, _)| owned(id)) {
            // 正在被写入的会话视为活跃
            if let Ok(guard) = entry.try_lock() {
                if now.saturating_sub(guard.last_used_ms) > idle_ms {
                    stale.push(id.clone());
                }
            }
        }
        for id in &stale {
            map.remove(id);
        }
        stale.len()
    }

    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
