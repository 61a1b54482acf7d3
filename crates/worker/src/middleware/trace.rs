use async_trait::async_trait;
use scheduler_core::TaskError;
use scheduler_infrastructure::{StructuredLogger, TaskTracer};

use super::{ExecutionContext, Middleware, Outcome};

/// 为每次尝试创建执行 span, 父上下文取自消息头中的链路信息
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn before(&self, ctx: &mut ExecutionContext) -> Result<(), TaskError> {
        ctx.span = TaskTracer::execute_span(&ctx.message, &ctx.worker_id);
        ctx.span.in_scope(|| StructuredLogger::log_task_started(&ctx.message, &ctx.worker_id));
        Ok(())
    }

    async fn after(&self, ctx: &mut ExecutionContext, outcome: Outcome) -> Outcome {
        let duration_ms = ctx.elapsed().as_millis() as u64;
        match &outcome {
            Outcome::Success(_) => {
                TaskTracer::record_success(&ctx.span, duration_ms);
                ctx.span
                    .in_scope(|| StructuredLogger::log_task_completed(&ctx.message, duration_ms));
            }
            other => {
                if let Some(error) = other.error() {
                    TaskTracer::record_error(&ctx.span, error);
                }
            }
        }
        outcome
    }
}
