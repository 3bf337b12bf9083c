//! 核心基础设施：错误类型、单调时钟、决策限流、工作池、优雅关闭

pub mod clock;
pub mod error;
pub mod limiter;
pub mod shutdown;
pub mod worker_pool;

pub use clock::MonotonicClock;
pub use error::{ConfigError, DispatchError, NpcError};
pub use limiter::{Admission, DecisionLimiter, DecisionTicket};
pub use shutdown::{
    run_with_graceful_shutdown, CleanupReport, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
pub use worker_pool::{Job, OverflowPolicy, SubmitOutcome, WorkerPool};
