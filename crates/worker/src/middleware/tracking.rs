use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scheduler_core::{
    config::ResultBackendFailurePolicy,
    models::error_kinds,
    traits::{ExecutionTracker, ResultBackend, TaskArgs},
    ExecutionStatus, TaskError, TaskResult, TransitionMetadata,
};
use tracing::{debug, warn, Instrument};

use super::{ExecutionContext, Middleware, Outcome};

/// 记录一次尝试的执行状态, 位于最内层
///
/// 处理函数执行前写入 `running`, 执行后先保存结果再写入 `success` 或 `failed`。
/// 这些写入都在本次尝试的执行 span 内进行。执行记录写入失败只记日志, 不影响任务本身。
pub struct TrackingMiddleware {
    tracker: Arc<dyn ExecutionTracker>,
    results: Arc<dyn ResultBackend>,
    result_ttl: Duration,
    failure_policy: ResultBackendFailurePolicy,
    store_args_snapshot: bool,
}

impl TrackingMiddleware {
    pub fn new(
        tracker: Arc<dyn ExecutionTracker>,
        results: Arc<dyn ResultBackend>,
        result_ttl: Duration,
        failure_policy: ResultBackendFailurePolicy,
        store_args_snapshot: bool,
    ) -> Self {
        Self {
            tracker,
            results,
            result_ttl,
            failure_policy,
            store_args_snapshot,
        }
    }

    async fn record(&self, ctx: &ExecutionContext, status: ExecutionStatus, error: Option<TaskError>) {
        let mut metadata = TransitionMetadata::new(ctx.task_name(), ctx.attempt());
        if let Some(error) = error {
            metadata = metadata.with_error(error);
        }
        if self.store_args_snapshot && status == ExecutionStatus::Running {
            metadata = metadata.with_args_snapshot(TaskArgs::from_message(&ctx.message).snapshot());
        }

        match self.tracker.record_transition(ctx.task_id(), status, metadata).await {
            Ok(true) => {}
            Ok(false) => debug!(task_id = %ctx.task_id(), status = %status, "执行记录已是终态, 忽略"),
            Err(e) => warn!(task_id = %ctx.task_id(), status = %status, "写入执行记录失败: {}", e),
        }
    }

    async fn store_success(&self, ctx: &ExecutionContext, value: &serde_json::Value) -> Result<(), TaskError> {
        let ttl = ctx.task.options.result_ttl.unwrap_or(self.result_ttl);
        let result = TaskResult::success(ctx.task_id(), ctx.task_name(), value.clone());
        match self.results.store(ctx.task_id(), &result, ttl).await {
            Ok(()) => Ok(()),
            Err(e) => match self.failure_policy {
                ResultBackendFailurePolicy::FailTask => Err(TaskError::new(
                    error_kinds::RESULT_BACKEND,
                    format!("保存任务结果失败: {e}"),
                )),
                ResultBackendFailurePolicy::LogAndContinue => {
                    warn!(task_id = %ctx.task_id(), "保存任务结果失败, 按配置继续: {}", e);
                    Ok(())
                }
            },
        }
    }

    async fn settle(&self, ctx: &ExecutionContext, outcome: Outcome) -> Outcome {
        let outcome = match outcome {
            Outcome::Success(value) => match self.store_success(ctx, &value).await {
                Ok(()) => Outcome::Success(value),
                Err(error) => Outcome::Error(error),
            },
            other => other,
        };

        match &outcome {
            Outcome::Success(_) => self.record(ctx, ExecutionStatus::Success, None).await,
            other => {
                self.record(ctx, ExecutionStatus::Failed, other.error().cloned())
                    .await
            }
        }
        outcome
    }
}

#[async_trait]
impl Middleware for TrackingMiddleware {
    fn name(&self) -> &'static str {
        "tracking"
    }

    async fn before(&self, ctx: &mut ExecutionContext) -> Result<(), TaskError> {
        self.record(ctx, ExecutionStatus::Running, None)
            .instrument(ctx.span.clone())
            .await;
        Ok(())
    }

    async fn after(&self, ctx: &mut ExecutionContext, outcome: Outcome) -> Outcome {
        let span = ctx.span.clone();
        self.settle(ctx, outcome).instrument(span).await
    }
}
