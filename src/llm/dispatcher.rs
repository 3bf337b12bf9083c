//! 请求调度器
//!
//! 一次 complete：读取会话历史快照 -> 拼接 [persona system, 历史..., user] -> 选择端点 -> 调用。
//! 成功时写回 {user, assistant} 并闭合熔断；失败时记入熔断、退避后重新选择端点重试。
//! 重试耗尽返回 DispatchError::NoServiceAvailable，从不 panic 到调用方。

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::selector::EndpointSelector;
use super::LlmError;
use crate::core::{DispatchError, MonotonicClock};
use crate::memory::{ConversationStore, Message};
use crate::observability::PerformanceCounters;

/// 重试参数
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 首次之外的最大重试次数
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Duration::from_millis(500),
        }
    }
}

/// 请求调度器
pub struct RequestDispatcher {
    selector: Arc<EndpointSelector>,
    store: Arc<ConversationStore>,
    counters: Arc<PerformanceCounters>,
    clock: MonotonicClock,
    retry: RetryPolicy,
}

impl RequestDispatcher {
    pub fn new(
        selector: Arc<EndpointSelector>,
        store: Arc<ConversationStore>,
        counters: Arc<PerformanceCounters>,
        clock: MonotonicClock,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            selector,
            store,
            counters,
            clock,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn selector(&self) -> &Arc<EndpointSelector> {
        &self.selector
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// 发送一条消息并返回助手回复
    pub async fn complete(
        &self,
        conversation_id: &str,
        message: &str,
        persona_context: Option<&str>,
    ) -> Result<String, DispatchError> {
        if message.trim().is_empty() {
            return Err(DispatchError::InvalidInput("empty message".into()));
        }

        let request_id = Uuid::new_v4();
        let started = self.clock.now_ms();
        self.counters.record_request();

        let registry = self.selector.registry();
        if registry.is_empty() {
            self.counters.record_failure();
            tracing::error!(%request_id, conversation_id, "no LLM endpoints configured");
            return Err(DispatchError::NoServiceAvailable {
                attempts: 0,
                last_error: None,
            });
        }

        let messages = self.build_messages(conversation_id, message, persona_context).await;

        let max_attempts = self.retry.max_retries + 1;
        let mut attempts = 0;
        let mut last_error: Option<LlmError> = None;

        while attempts < max_attempts {
            if attempts > 0 {
                tokio::time::sleep(self.retry.backoff).await;
            }
            let Some(endpoint) = self.selector.select() else {
                break;
            };
            attempts += 1;

            let result = endpoint
                .client()
                .complete(&messages)
                .await
                .and_then(|reply| {
                    if reply.trim().is_empty() {
                        Err(LlmError::MalformedResponse("empty content".into()))
                    } else {
                        Ok(reply)
                    }
                });

            match result {
                Ok(reply) => {
                    registry.report_success(&endpoint);
                    self.store
                        .append_exchange(conversation_id, message, &reply)
                        .await;
                    let latency = self.clock.now_ms().saturating_sub(started);
                    self.counters.record_success(latency);
                    tracing::debug!(
                        %request_id,
                        conversation_id,
                        endpoint = endpoint.id(),
                        attempt = attempts,
                        latency_ms = latency,
                        "completion succeeded"
                    );
                    return Ok(reply);
                }
                Err(err) => {
                    registry.report_failure(&endpoint);
                    tracing::warn!(
                        %request_id,
                        conversation_id,
                        endpoint = endpoint.id(),
                        attempt = attempts,
                        error = %err,
                        "completion attempt failed"
                    );
                    let retryable = err.is_retryable();
                    last_error = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        self.counters.record_failure();
        tracing::error!(
            %request_id,
            conversation_id,
            attempts,
            "no service available after retries"
        );
        Err(DispatchError::NoServiceAvailable {
            attempts,
            last_error,
        })
    }

    /// 历史只读一次快照，重试期间保持不变
    async fn build_messages(
        &self,
        conversation_id: &str,
        message: &str,
        persona_context: Option<&str>,
    ) -> Vec<Message> {
        let history = self.store.snapshot(conversation_id).await;
        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(context) = persona_context.filter(|c| !c.trim().is_empty()) {
            messages.push(Message::system(context));
        }
        messages.extend(history);
        messages.push(Message::user(message));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::endpoint::{Endpoint, EndpointRegistry, EndpointSpec};
    use crate::llm::selector::SelectionPolicy;
    use crate::llm::MockLlmClient;
    use crate::memory::Role;

    struct Fixture {
        dispatcher: RequestDispatcher,
        registry: Arc<EndpointRegistry>,
        counters: Arc<PerformanceCounters>,
    }

    fn fixture(clients: Vec<(&str, Arc<MockLlmClient>)>, policy: SelectionPolicy) -> Fixture {
        let clock = MonotonicClock::new();
        let endpoints = clients
            .into_iter()
            .map(|(id, client)| {
                let spec = EndpointSpec::new(id, "m").with_failure_threshold(2);
                Arc::new(Endpoint::new(spec, client).unwrap())
            })
            .collect();
        let registry = Arc::new(EndpointRegistry::new(endpoints, clock));
        let selector = Arc::new(EndpointSelector::new(Arc::clone(&registry), policy));
        let store = Arc::new(ConversationStore::new(10, clock));
        let counters = Arc::new(PerformanceCounters::new());
        let dispatcher = RequestDispatcher::new(
            selector,
            store,
            Arc::clone(&counters),
            clock,
            RetryPolicy {
                max_retries: 2,
                backoff: Duration::from_millis(10),
            },
        );
        Fixture {
            dispatcher,
            registry,
            counters,
        }
    }

    #[tokio::test]
    async fn test_success_appends_history_and_prepends_persona() {
        let client = Arc::new(MockLlmClient::replying("hi there"));
        let f = fixture(vec![("a", Arc::clone(&client))], SelectionPolicy::Single);

        let reply = f
            .dispatcher
            .complete("p1", "hello", Some("You are a pirate."))
            .await
            .unwrap();
        assert_eq!(reply, "hi there");

        let sent = client.last_messages();
        assert_eq!(sent[0], Message::system("You are a pirate."));
        assert_eq!(sent[1], Message::user("hello"));

        f.dispatcher.complete("p1", "again", None).await.unwrap();
        let sent = client.last_messages();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].role, Role::User);
        assert_eq!(sent[1], Message::assistant("hi there"));

        assert_eq!(f.dispatcher.store().message_count("p1").await, 4);
        assert_eq!(f.counters.snapshot().total_requests, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_on_other_endpoint() {
        let bad = Arc::new(MockLlmClient::failing(LlmError::Timeout(30_000)));
        let good = Arc::new(MockLlmClient::replying("ok"));
        let f = fixture(
            vec![("bad", Arc::clone(&bad)), ("good", Arc::clone(&good))],
            SelectionPolicy::Failover,
        );

        // 游标从 bad 之后开始：先 good，再 bad，再 good
        let _ = f.dispatcher.complete("c", "1", None).await.unwrap();
        let reply = f.dispatcher.complete("c", "2", None).await.unwrap();
        assert_eq!(reply, "ok");
        assert_eq!(bad.calls(), 1);
        assert_eq!(f.registry.get("bad").unwrap().failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_no_service_and_keeps_history_clean() {
        let client = Arc::new(MockLlmClient::failing(LlmError::Transport("reset".into())));
        let f = fixture(vec![("a", Arc::clone(&client))], SelectionPolicy::Single);

        let err = f.dispatcher.complete("c", "hello", None).await.unwrap_err();
        match err {
            DispatchError::NoServiceAvailable {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, Some(LlmError::Transport("reset".into())));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.calls(), 3);
        assert!(!f.dispatcher.store().contains("c").await);
        assert_eq!(f.counters.snapshot().failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_reply_is_malformed_and_retried() {
        let client = Arc::new(MockLlmClient::replying("fine").then_ok("   "));
        let f = fixture(vec![("a", Arc::clone(&client))], SelectionPolicy::Single);
        assert_eq!(f.dispatcher.complete("c", "q", None).await.unwrap(), "fine");
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_no_endpoints_is_degraded_not_panic() {
        let f = fixture(vec![], SelectionPolicy::WeightedRandom);
        let err = f.dispatcher.complete("c", "q", None).await.unwrap_err();
        assert!(err.is_no_service());
        assert!(f.registry.health().degraded);
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let f = fixture(
            vec![("a", Arc::new(MockLlmClient::new()))],
            SelectionPolicy::Single,
        );
        assert!(matches!(
            f.dispatcher.complete("c", "  ", None).await,
            Err(DispatchError::InvalidInput(_))
        ));
    }
}
