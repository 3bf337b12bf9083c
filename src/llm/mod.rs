//! LLM 层：后端客户端抽象、端点注册与熔断、选择策略、带重试的请求调度

pub mod dispatcher;
pub mod endpoint;
pub mod mock;
pub mod openai;
pub mod presets;
pub mod selector;
pub mod traits;

pub use dispatcher::{RequestDispatcher, RetryPolicy};
pub use endpoint::{Endpoint, EndpointHealth, EndpointRegistry, EndpointSpec, RegistryHealth};
pub use mock::MockLlmClient;
pub use openai::{ModelParams, OpenAiClient, TokenUsage};
pub use presets::Provider;
pub use selector::{EndpointSelector, SelectionPolicy};
pub use traits::{LlmClient, LlmError};
