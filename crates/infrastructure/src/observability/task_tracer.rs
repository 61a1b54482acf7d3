use opentelemetry_semantic_conventions::trace as semconv;
use scheduler_core::models::{TaskError, TaskMessage};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::CrossComponentTracer;

pub struct TaskTracer;

impl TaskTracer {
    /// 入队 span, 在发布前创建以便其上下文被写入消息头
    pub fn enqueue_span(task_name: &str, queue: &str) -> tracing::Span {
        let span = tracing::info_span!(
            "enqueue_task",
            task.name = task_name,
            mq.queue = queue,
            otel.kind = "producer"
        );
        span.set_attribute("messaging.system", "scheduler");
        span.set_attribute("messaging.destination.name", queue.to_string());
        span
    }

    /// 调度器触发作业的 span
    pub fn fire_job_span(job_id: &str, task_name: &str) -> tracing::Span {
        tracing::info_span!(
            "fire_job",
            job.id = job_id,
            task.name = task_name,
            otel.kind = "internal"
        )
    }

    /// 任务执行 span, 父上下文来自消息头
    pub fn execute_span(message: &TaskMessage, worker_id: &str) -> tracing::Span {
        let span = tracing::info_span!(
            "execute_task",
            task.id = %message.task_id,
            task.name = %message.task_name,
            task.attempt = message.attempt(),
            worker.id = worker_id,
            otel.kind = "consumer",
            otel.status_code = tracing::field::Empty,
        );
        CrossComponentTracer::link_remote_parent(&span, &message.headers.trace_context);
        span.set_attribute("messaging.message.id", message.task_id.clone());
        span
    }

    pub fn record_success(span: &tracing::Span, duration_ms: u64) {
        span.record("otel.status_code", "OK");
        span.set_attribute("task.success", true);
        span.set_attribute("task.execution_time_ms", duration_ms as i64);
    }

    pub fn record_error(span: &tracing::Span, error: &TaskError) {
        span.record("otel.status_code", "ERROR");
        span.set_attribute("task.success", false);
        span.set_attribute(semconv::ERROR_TYPE, error.kind.clone());
        span.set_attribute("task.error_message", error.message.clone());
    }

    pub fn record_retry(span: &tracing::Span, attempt: u32, delay_ms: u64) {
        span.set_attribute("task.retry_attempt", i64::from(attempt));
        span.set_attribute("task.retry_delay_ms", delay_ms as i64);
    }
}
