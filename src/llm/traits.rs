//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Gemini / Mock）实现 LlmClient::complete。
//! 协议与鉴权细节封装在实现内部，调度层只关心「消息列表 -> 回复文本 或 结构化错误」。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::Message;

/// 单次补全调用的失败原因
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    /// 超时（毫秒）
    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("API error: {0}")]
    Api(String),

    /// 传输成功但响应里没有可用内容
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
}

impl LlmError {
    /// 调度层是否应换端点重试；目前所有后端错误都计入熔断并允许重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Transport(_)
                | Self::Api(_)
                | Self::MalformedResponse(_)
                | Self::RateLimited { .. }
        )
    }
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成，返回助手回复文本
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
