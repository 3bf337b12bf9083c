//! Hive - 多后端 AI 补全调度 + NPC 分层决策核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、单调时钟、决策限流、工作池、优雅关闭
//! - **llm**: 后端客户端抽象与实现、端点注册与熔断、选择策略、请求调度
//! - **memory**: 有界会话历史与并发会话存储
//! - **npc**: Agent 状态机、行为参数、AI 决策、分层调度、宿主世界接缝
//! - **observability**: 日志初始化与性能计数器
//! - **persona**: 人设与玩家选择

pub mod config;
pub mod core;
pub mod hive;
pub mod llm;
pub mod memory;
pub mod npc;
pub mod observability;
pub mod persona;

pub use hive::{AdminSnapshot, ChatError, Hive};
