//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! 先消费脚本队列中的结果，队列为空后按 fallback 模式响应（回显 / 固定文本 / 固定错误）。
//! 记录调用次数与最后一次收到的消息，便于断言调度行为。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};
use crate::memory::{Message, Role};

#[derive(Debug, Clone)]
enum Fallback {
    /// 回显最后一条 User 消息
    Echo,
    Reply(String),
    Fail(LlmError),
}

/// 可编排的 Mock 客户端
#[derive(Debug)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Fallback,
    latency: Option<Duration>,
    calls: AtomicUsize,
    last_messages: Mutex<Vec<Message>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    /// 回显模式
    pub fn new() -> Self {
        Self::with_fallback(Fallback::Echo)
    }

    /// 每次都返回同一段文本
    pub fn replying(text: impl Into<String>) -> Self {
        Self::with_fallback(Fallback::Reply(text.into()))
    }

    /// 每次都失败
    pub fn failing(err: LlmError) -> Self {
        Self::with_fallback(Fallback::Fail(err))
    }

    fn with_fallback(fallback: Fallback) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            latency: None,
            calls: AtomicUsize::new(0),
            last_messages: Mutex::new(Vec::new()),
        }
    }

    /// 追加一个脚本化的成功结果
    pub fn then_ok(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()));
        self
    }

    /// 追加一个脚本化的失败结果
    pub fn then_err(self, err: LlmError) -> Self {
        self.push(Err(err));
        self
    }

    /// 每次调用前等待一段时间（配合 start_paused 测试并发）
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn push(&self, result: Result<String, LlmError>) {
        self.script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_messages(&self) -> Vec<Message> {
        self.last_messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_messages.lock().unwrap_or_else(|p| p.into_inner()) = messages.to_vec();

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        if let Some(result) = scripted {
            return result;
        }

        match &self.fallback {
            Fallback::Echo => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                Ok(format!("Echo from Mock: {last_user}"))
            }
            Fallback::Reply(text) => Ok(text.clone()),
            Fallback::Fail(err) => Err(err.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_mode() {
        let mock = MockLlmClient::new();
        let reply = mock
            .complete(&[Message::system("ctx"), Message::user("hello")])
            .await
            .unwrap();
        assert_eq!(reply, "Echo from Mock: hello");
        assert_eq!(mock.calls(), 1);
        assert_eq!(mock.last_messages().len(), 2);
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let mock = MockLlmClient::replying("steady")
            .then_err(LlmError::Timeout(10))
            .then_ok("first");
        assert_eq!(mock.complete(&[]).await, Err(LlmError::Timeout(10)));
        assert_eq!(mock.complete(&[]).await.unwrap(), "first");
        assert_eq!(mock.complete(&[]).await.unwrap(), "steady");
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let mock = MockLlmClient::failing(LlmError::Transport("down".into()));
        assert!(mock.complete(&[Message::user("x")]).await.is_err());
    }
}
