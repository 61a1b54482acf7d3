//! 任务执行中间件
//!
//! 每次处理函数调用都被一组固定顺序的中间件包裹 (由外到内):
//!
//! ```text
//! Retry → Metrics → Tracing → Tracking → handler
//! ```
//!
//! `before` 由外向内依次调用, `after` 由内向外依次调用。某一层的 `before` 失败时
//! 处理函数不会执行, 只有已经进入的外层会收到 `after`。
//! 除 Retry 之外, 各层必须原样传递结果。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scheduler_core::{
    DeadLetterInfo, RegisteredTask, RetryState, TaskError, TaskMessage,
};
use serde_json::Value;
use tokio::time::Instant;

pub mod metrics;
pub mod retry;
pub mod trace;
pub mod tracking;

pub use metrics::MetricsMiddleware;
pub use retry::RetryMiddleware;
pub use trace::TracingMiddleware;
pub use tracking::TrackingMiddleware;

/// 一次尝试的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    /// 处理函数失败, 尚未被重试层处置
    Error(TaskError),
    /// 已安排延迟重新投递
    Retrying {
        error: TaskError,
        delay: Duration,
        next_attempt: u32,
    },
    /// 已进入死信队列
    Failed {
        error: TaskError,
        dead_letter: DeadLetterInfo,
    },
}

impl Outcome {
    pub fn status_label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Error(_) => "failed",
            Outcome::Retrying { .. } => "retrying",
            Outcome::Failed { .. } => "dead_lettered",
        }
    }

    /// 已被处置 (成功、已安排重试或已进入死信队列), 原投递可以确认
    pub fn is_settled(&self) -> bool {
        !matches!(self, Outcome::Error(_))
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Error(error)
            | Outcome::Retrying { error, .. }
            | Outcome::Failed { error, .. } => Some(error),
        }
    }
}

/// 中间件之间共享的执行上下文
pub struct ExecutionContext {
    pub message: TaskMessage,
    pub queue: String,
    pub worker_id: String,
    pub task: Arc<RegisteredTask>,
    pub retry: RetryState,
    pub started_at: Instant,
    /// 由 Tracing 层创建, 处理函数在该 span 内执行
    pub span: tracing::Span,
}

impl ExecutionContext {
    pub fn new(
        queue: impl Into<String>,
        message: TaskMessage,
        task: Arc<RegisteredTask>,
        worker_id: impl Into<String>,
    ) -> Self {
        let retry = RetryState::from_message(
            &message,
            task.options.max_attempts,
            &task.options.retry_policy,
        );
        Self {
            message,
            queue: queue.into(),
            worker_id: worker_id.into(),
            task,
            retry,
            started_at: Instant::now(),
            span: tracing::Span::none(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.message.task_id
    }

    pub fn task_name(&self) -> &str {
        &self.message.task_name
    }

    pub fn attempt(&self) -> u32 {
        self.message.attempt()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn before(&self, _ctx: &mut ExecutionContext) -> Result<(), TaskError> {
        Ok(())
    }

    async fn after(&self, ctx: &mut ExecutionContext, outcome: Outcome) -> Outcome;
}
