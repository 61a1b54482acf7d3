//! 指标采集
//!
//! 只依赖 `metrics` 门面；未安装导出器时所有调用都是空操作。

use metrics::{counter, gauge, histogram};

pub const TASKS_TOTAL: &str = "tasks_total";
pub const TASK_DURATION_SECONDS: &str = "task_duration_seconds";
pub const TASKS_DEAD_LETTERED_TOTAL: &str = "tasks_dead_lettered_total";
pub const JOBS_FIRED_TOTAL: &str = "scheduler_jobs_fired_total";
pub const PUBLISH_FAILURES_TOTAL: &str = "scheduler_publish_failures_total";
pub const WORKER_IN_FLIGHT_TASKS: &str = "worker_in_flight_tasks";

pub struct MetricsCollector;

impl MetricsCollector {
    /// 记录一次任务尝试的结果与耗时, 与第几次尝试无关
    pub fn record_task_outcome(task_name: &str, status: &str, duration_seconds: f64) {
        counter!(
            TASKS_TOTAL,
            "task_name" => task_name.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!(TASK_DURATION_SECONDS, "task_name" => task_name.to_string())
            .record(duration_seconds);
    }

    pub fn record_dead_lettered(task_name: &str, reason: &str) {
        counter!(
            TASKS_DEAD_LETTERED_TOTAL,
            "task_name" => task_name.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    pub fn record_job_fired(job_id: &str) {
        counter!(JOBS_FIRED_TOTAL, "job_id" => job_id.to_string()).increment(1);
    }

    pub fn record_publish_failure(job_id: &str) {
        counter!(PUBLISH_FAILURES_TOTAL, "job_id" => job_id.to_string()).increment(1);
    }

    pub fn set_in_flight(worker_id: &str, in_flight: usize) {
        gauge!(WORKER_IN_FLIGHT_TASKS, "worker_id" => worker_id.to_string()).set(in_flight as f64);
    }
}
