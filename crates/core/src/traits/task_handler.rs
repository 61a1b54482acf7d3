//! 任务处理函数契约
//!
//! 处理函数签名为 `handler(ctx, args) -> Result`。`ctx` 携带截止时间，
//! 处理函数可以主动检查；核心不会抢占处理函数，只会在超时后停止等待。
//!
//! ```rust,ignore
//! use scheduler_core::traits::{HandlerResult, TaskArgs, TaskContext};
//!
//! async fn send_report(ctx: TaskContext, args: TaskArgs) -> HandlerResult {
//!     if ctx.is_expired() {
//!         return Err(TaskError::timeout(ctx.timeout));
//!     }
//!     Ok(serde_json::json!({"sent": args.kwarg("to")}))
//! }
//!
//! registry.register_task("send_report", send_report, TaskOptions::default()).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::models::{TaskError, TaskMessage};

pub type HandlerResult = Result<Value, TaskError>;

/// 任务参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn from_message(message: &TaskMessage) -> Self {
        Self::new(message.args.clone(), message.kwargs.clone())
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// 用于执行记录的参数快照
    pub fn snapshot(&self) -> Value {
        serde_json::json!({ "args": self.args, "kwargs": self.kwargs })
    }
}

/// 处理函数的执行上下文
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub task_name: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub idempotency_key: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub timeout: Duration,
    deadline: Instant,
}

impl TaskContext {
    pub fn new(message: &TaskMessage, max_attempts: u32, timeout: Duration) -> Self {
        Self {
            task_id: message.task_id.clone(),
            task_name: message.task_name.clone(),
            attempt: message.attempt(),
            max_attempts,
            idempotency_key: message.headers.idempotency_key.clone(),
            enqueued_at: message.headers.enqueued_at,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// 任务处理函数
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext, args: TaskArgs) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskContext, TaskArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext, args: TaskArgs) -> HandlerResult {
        (self)(ctx, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn echo(_ctx: TaskContext, args: TaskArgs) -> HandlerResult {
        Ok(json!({ "first": args.arg(0).cloned() }))
    }

    #[tokio::test]
    async fn test_async_fn_is_handler() {
        let message = TaskMessage::new("echo", vec![json!(7)], Map::new());
        let ctx = TaskContext::new(&message, 3, Duration::from_secs(5));
        let handler: Box<dyn TaskHandler> = Box::new(echo);

        let value = handler
            .handle(ctx, TaskArgs::from_message(&message))
            .await
            .unwrap();
        assert_eq!(value, json!({"first": 7}));
    }

    #[tokio::test]
    async fn test_context_deadline() {
        let message = TaskMessage::new("echo", vec![], Map::new());
        let ctx = TaskContext::new(&message, 1, Duration::from_millis(20));
        assert!(!ctx.is_expired());
        assert!(ctx.is_last_attempt());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_args_snapshot() {
        let mut kwargs = Map::new();
        kwargs.insert("days".to_string(), json!(30));
        let args = TaskArgs::new(vec![json!("a")], kwargs);
        assert_eq!(args.kwarg("days"), Some(&json!(30)));
        assert_eq!(args.snapshot(), json!({"args": ["a"], "kwargs": {"days": 30}}));
    }
}
