//! 任务调度子系统的核心抽象：数据模型、组件接口、任务注册表、重试策略与配置。

pub mod config;
pub mod errors;
pub mod models;
pub mod registry;
pub mod retry;
pub mod traits;

pub use errors::*;
pub use models::{
    DeadLetterInfo, DeadLetterReason, ExecutionQuery, ExecutionRecord, ExecutionStatus, Job, Page,
    TaskError, TaskMessage, TaskResult, TransitionMetadata, Trigger,
};
pub use registry::{RegisteredTask, TaskOptions, TaskRegistry};
pub use retry::{RetryClassifier, RetryDecision, RetryPolicy, RetryState};
pub use traits::{
    Delivery, ExecutionTracker, HandlerResult, JobStore, MessageQueue, ResultBackend, TaskArgs,
    TaskContext, TaskHandler,
};
