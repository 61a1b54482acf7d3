//! 生命周期事件日志
//!
//! 统一字段名 (`task_id`, `task_name`, `attempt`, `job_id`)，便于按任务检索日志。

use chrono::{DateTime, Utc};
use scheduler_core::models::{DeadLetterInfo, TaskError, TaskMessage};
use tracing::{debug, error, info, warn};

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_task_enqueued(message: &TaskMessage, queue: &str) {
        info!(
            event = "task_enqueued",
            task_id = %message.task_id,
            task_name = %message.task_name,
            queue = queue,
            idempotency_key = ?message.headers.idempotency_key,
            "任务已入队"
        );
    }

    pub fn log_job_fired(job_id: &str, task_id: &str, next_run_time: Option<DateTime<Utc>>) {
        info!(
            event = "job_fired",
            job_id = job_id,
            task_id = task_id,
            next_run_time = ?next_run_time,
            "作业已触发"
        );
    }

    pub fn log_job_misfire_skipped(job_id: &str, scheduled_at: DateTime<Utc>, late_ms: i64) {
        warn!(
            event = "job_misfire_skipped",
            job_id = job_id,
            scheduled_at = %scheduled_at,
            late_ms,
            "作业错过触发时间且超出宽限期, 本次触发被合并跳过"
        );
    }

    pub fn log_publish_failed(job_id: &str, error: &dyn std::error::Error) {
        error!(
            event = "job_publish_failed",
            job_id = job_id,
            error = %error,
            "作业触发时发布任务消息失败"
        );
    }

    pub fn log_task_started(message: &TaskMessage, worker_id: &str) {
        debug!(
            event = "task_started",
            task_id = %message.task_id,
            task_name = %message.task_name,
            attempt = message.attempt(),
            worker_id = worker_id,
            "任务开始执行"
        );
    }

    pub fn log_task_completed(message: &TaskMessage, duration_ms: u64) {
        info!(
            event = "task_completed",
            task_id = %message.task_id,
            task_name = %message.task_name,
            attempt = message.attempt(),
            duration_ms,
            "任务执行成功"
        );
    }

    pub fn log_task_retry(message: &TaskMessage, error: &TaskError, delay_ms: u64) {
        warn!(
            event = "task_retry",
            task_id = %message.task_id,
            task_name = %message.task_name,
            attempt = message.attempt(),
            error_kind = %error.kind,
            error = %error.message,
            delay_ms,
            "任务失败, 已安排重试"
        );
    }

    pub fn log_task_dead_lettered(message: &TaskMessage, info: &DeadLetterInfo) {
        error!(
            event = "task_dead_lettered",
            task_id = %message.task_id,
            task_name = %message.task_name,
            attempt = info.attempt_count,
            reason = info.reason.as_str(),
            elapsed_ms = info.elapsed_ms,
            error = ?info.last_error.as_ref().map(|e| e.to_string()),
            "任务进入死信队列"
        );
    }
}
