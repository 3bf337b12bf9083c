//! 编排层错误类型
//!
//! - DispatchError：调度器对外暴露的可区分失败（重试耗尽 / 输入非法），不会以 panic 形式逃逸到调用方
//! - ConfigError：单个端点或 Agent 定义的配置错误，只影响该条目，其余照常工作
//! - NpcError：NPC 管理面的操作失败

use thiserror::Error;

use crate::llm::LlmError;

/// 调度失败：调用方（聊天入口、NPC 决策执行器）据此降级
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    /// 所有重试都失败，或当前没有任何可用端点
    #[error("No service available after {attempts} attempt(s){}", describe_last(.last_error))]
    NoServiceAvailable {
        attempts: u32,
        last_error: Option<LlmError>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

fn describe_last(last_error: &Option<LlmError>) -> String {
    last_error
        .as_ref()
        .map(|e| format!(": {e}"))
        .unwrap_or_default()
}

impl DispatchError {
    pub fn is_no_service(&self) -> bool {
        matches!(self, Self::NoServiceAvailable { .. })
    }
}

/// 配置错误：加载阶段发现，记录后跳过对应条目
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Endpoint '{0}' has no model configured")]
    MissingModel(String),

    #[error("Endpoint '{endpoint}' credential env var '{var}' is not set")]
    MissingCredential { endpoint: String, var: String },

    #[error("Endpoint '{endpoint}' has invalid weight {weight}")]
    InvalidWeight { endpoint: String, weight: f64 },

    #[error("Unknown provider '{provider}' for endpoint '{endpoint}'")]
    UnknownProvider { endpoint: String, provider: String },

    #[error("Unknown selection policy '{0}'")]
    UnknownPolicy(String),

    #[error("Agent '{0}' definition is invalid: {1}")]
    InvalidAgent(String, String),
}

/// NPC 管理面错误
#[derive(Error, Debug, Clone)]
pub enum NpcError {
    #[error("Agent '{0}' already exists")]
    DuplicateAgent(String),

    #[error("Agent '{0}' not found")]
    UnknownAgent(String),

    #[error("Agent '{0}' is asleep")]
    Asleep(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
