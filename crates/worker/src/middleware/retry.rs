use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{
    models::error_kinds,
    traits::{ExecutionTracker, MessageQueue, ResultBackend},
    DeadLetterInfo, DeadLetterReason, ExecutionStatus, RetryDecision, TaskError, TaskResult,
    TransitionMetadata,
};
use scheduler_infrastructure::{MetricsCollector, StructuredLogger, TaskTracer};
use tracing::{error, warn, Instrument};

use super::{ExecutionContext, Middleware, Outcome};

/// 重试层, 位于最外层
///
/// 失败时依据错误分类、剩余次数与截止时间决定: 延迟重新投递下一次尝试,
/// 或把消息连同重试统计发送到死信队列。这是唯一可以吞掉错误的中间件。
/// 重新投递或死信发布本身失败时返回 [`Outcome::Error`], 由工作池把原投递重新入队。
pub struct RetryMiddleware {
    broker: Arc<dyn MessageQueue>,
    tracker: Arc<dyn ExecutionTracker>,
    results: Arc<dyn ResultBackend>,
    result_ttl: Duration,
}

impl RetryMiddleware {
    pub fn new(
        broker: Arc<dyn MessageQueue>,
        tracker: Arc<dyn ExecutionTracker>,
        results: Arc<dyn ResultBackend>,
        result_ttl: Duration,
    ) -> Self {
        Self {
            broker,
            tracker,
            results,
            result_ttl,
        }
    }

    async fn record(
        &self,
        ctx: &ExecutionContext,
        status: ExecutionStatus,
        error: &TaskError,
    ) {
        let metadata =
            TransitionMetadata::new(ctx.task_name(), ctx.attempt()).with_error(error.clone());
        if let Err(e) = self
            .tracker
            .record_transition(ctx.task_id(), status, metadata)
            .await
        {
            warn!(task_id = %ctx.task_id(), status = %status, "写入执行记录失败: {}", e);
        }
    }

    async fn schedule_retry(
        &self,
        ctx: &mut ExecutionContext,
        error: TaskError,
        delay: Duration,
        next_attempt: u32,
    ) -> Outcome {
        let next = ctx.message.next_attempt();
        if let Err(e) = self.broker.publish_delayed(&ctx.queue, &next, delay).await {
            error!(task_id = %ctx.task_id(), "安排重试失败: {}", e);
            return Outcome::Error(infrastructure_error("安排重试失败", e));
        }

        let delay_ms = delay.as_millis() as u64;
        ctx.retry.next_delay_ms = delay_ms;
        TaskTracer::record_retry(&ctx.span, ctx.attempt(), delay_ms);
        ctx.span
            .in_scope(|| StructuredLogger::log_task_retry(&ctx.message, &error, delay_ms));
        self.record(ctx, ExecutionStatus::Retrying, &error)
            .instrument(ctx.span.clone())
            .await;

        Outcome::Retrying {
            error,
            delay,
            next_attempt,
        }
    }

    async fn dead_letter(
        &self,
        ctx: &mut ExecutionContext,
        error: TaskError,
        reason: DeadLetterReason,
    ) -> Outcome {
        let now = Utc::now();
        let info = DeadLetterInfo {
            reason,
            attempt_count: ctx.attempt(),
            elapsed_ms: ctx.message.elapsed_ms(now),
            last_error: Some(error.clone()),
            dead_lettered_at: now,
        };

        let dead = ctx.message.dead_lettered(info.clone());
        if let Err(e) = self.broker.publish_dead_letter(&ctx.queue, &dead).await {
            error!(task_id = %ctx.task_id(), "发布死信消息失败: {}", e);
            return Outcome::Error(infrastructure_error("发布死信消息失败", e));
        }

        let ttl = ctx.task.options.result_ttl.unwrap_or(self.result_ttl);
        let result = TaskResult::failure(ctx.task_id(), ctx.task_name(), error.clone());
        if let Err(e) = self.results.store(ctx.task_id(), &result, ttl).await {
            warn!(task_id = %ctx.task_id(), "保存失败结果出错: {}", e);
        }

        MetricsCollector::record_dead_lettered(ctx.task_name(), reason.as_str());
        ctx.span
            .in_scope(|| StructuredLogger::log_task_dead_lettered(&ctx.message, &info));
        self.record(ctx, ExecutionStatus::DeadLettered, &error)
            .instrument(ctx.span.clone())
            .await;

        Outcome::Failed {
            error,
            dead_letter: info,
        }
    }
}

fn infrastructure_error(context: &str, e: impl std::fmt::Display) -> TaskError {
    TaskError::new(error_kinds::INFRASTRUCTURE, format!("{context}: {e}"))
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn after(&self, ctx: &mut ExecutionContext, outcome: Outcome) -> Outcome {
        let error = match outcome {
            Outcome::Error(error) => error,
            other => return other,
        };

        let options = &ctx.task.options;
        let decision = ctx.retry.decide(
            &error,
            &options.classifier,
            &options.retry_policy,
            Utc::now(),
        );
        match decision {
            RetryDecision::Retry {
                delay,
                next_attempt,
            } => self.schedule_retry(ctx, error, delay, next_attempt).await,
            RetryDecision::DeadLetter(reason) => self.dead_letter(ctx, error, reason).await,
        }
    }
}
