//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；DeepSeek、Gemini 兼容层、自建代理均可。
//! 每个端点一个客户端实例，携带自己的模型参数与超时。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// 单次调用的模型参数
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl ModelParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.7,
            max_tokens: 4096,
            timeout: Duration::from_millis(30_000),
        }
    }
}

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    params: ModelParams,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, api_key: &str, params: ModelParams) -> Self {
        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            params,
            usage: TokenUsage::new(),
        }
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    fn to_openai_messages(
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        messages
            .iter()
            .map(|m| {
                let message: ChatCompletionRequestMessage = match m.role {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()?
                        .into(),
                    Role::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()?
                        .into(),
                    Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()?
                        .into(),
                };
                Ok(message)
            })
            .collect()
    }

    async fn request(&self, messages: &[Message]) -> Result<String, LlmError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.params.model)
            .messages(Self::to_openai_messages(messages).map_err(map_openai_error)?)
            .temperature(self.params.temperature)
            .max_completion_tokens(self.params.max_tokens)
            .build()
            .map_err(map_openai_error)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_openai_error)?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| LlmError::MalformedResponse("response has no content".into()))
    }
}

fn map_openai_error(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::ApiError(api) => {
            let lowered = api.message.to_ascii_lowercase();
            if lowered.contains("rate limit") || lowered.contains("quota") {
                LlmError::RateLimited { retry_after_ms: 0 }
            } else {
                LlmError::Api(api.message)
            }
        }
        OpenAIError::JSONDeserialize(..) => LlmError::MalformedResponse(err.to_string()),
        other => LlmError::Transport(other.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let timeout = self.params.timeout;
        match tokio::time::timeout(timeout, self.request(messages)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_conversion_preserves_order() {
        let converted = OpenAiClient::to_openai_messages(&[
            Message::system("s"),
            Message::user("u"),
            Message::assistant("a"),
        ])
        .unwrap();
        assert_eq!(converted.len(), 3);
        assert!(matches!(converted[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(converted[1], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(converted[2], ChatCompletionRequestMessage::Assistant(_)));
    }

    #[test]
    fn test_token_usage_accumulates() {
        let usage = TokenUsage::new();
        usage.add(10, 5);
        usage.add(1, 1);
        assert_eq!(usage.get(), (11, 6, 17));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_maps_to_error() {
        let mut params = ModelParams::new("m");
        params.timeout = Duration::from_millis(2_000);
        let client = OpenAiClient::new(Some("http://127.0.0.1:1/v1"), "sk-test", params);
        let err = client.complete(&[Message::user("hi")]).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
