//! 短期记忆：对话历史
//!
//! 保留最近 N 轮对话（user/assistant 对），超出时从最旧的一对开始淘汰。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 短期记忆：最近 N 轮对话（每轮含 user + assistant，故最多保留 max_turns*2 条消息）
#[derive(Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    max_turns: usize,
}

impl ConversationMemory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_turns: max_turns.max(1),
        }
    }

    /// 追加一轮问答；超出上限时整对淘汰最旧的记录
    pub fn push_exchange(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.messages.push(Message::user(user));
        self.messages.push(Message::assistant(assistant));
        self.prune();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 最近 n 条消息
    pub fn recent(&self, n: usize) -> &[Message] {
        &self.messages[self.messages.len().saturating_sub(n)..]
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    fn prune(&mut self) {
        let cap = self.max_turns * 2;
        while self.messages.len() > cap {
            let drop = 2.min(self.messages.len());
            self.messages.drain(..drop);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
