use async_trait::async_trait;
use scheduler_infrastructure::MetricsCollector;

use super::{ExecutionContext, Middleware, Outcome};

/// 每次尝试都计数, 不区分第几次
pub struct MetricsMiddleware;

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn after(&self, ctx: &mut ExecutionContext, outcome: Outcome) -> Outcome {
        MetricsCollector::record_task_outcome(
            ctx.task_name(),
            outcome.status_label(),
            ctx.elapsed().as_secs_f64(),
        );
        outcome
    }
}
