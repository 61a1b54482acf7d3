//! 执行记录保留
//!
//! 清理本身也是一个普通任务，由调度器按 cron 触发、经消息队列交给工作池执行。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::info;

use scheduler_core::{
    config::TrackerConfig,
    models::{Job, Trigger},
    traits::{ExecutionTracker, TaskArgs, TaskContext},
    SchedulerError, SchedulerResult, TaskError, TaskRegistry,
};

use crate::scheduler::Scheduler;

pub const RETENTION_TASK_NAME: &str = "scheduler.cleanup_executions";
pub const RETENTION_JOB_ID: &str = "scheduler.cleanup_executions";

/// 注册清理任务, 删除早于 `retention_days` 天的执行记录
pub async fn register_retention_task(
    registry: &TaskRegistry,
    tracker: Arc<dyn ExecutionTracker>,
    retention_days: u32,
) -> SchedulerResult<()> {
    let handler = move |_ctx: TaskContext, _args: TaskArgs| {
        let tracker = tracker.clone();
        async move {
            let cutoff = Utc::now()
                .checked_sub_signed(Duration::days(i64::from(retention_days)))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let deleted = tracker
                .cleanup_older_than(cutoff)
                .await
                .map_err(|e| TaskError::transient(e.to_string()))?;

            info!(deleted, cutoff = %cutoff, "已清理过期执行记录");
            Ok(json!({ "deleted": deleted }))
        }
    };

    registry
        .register_task(
            RETENTION_TASK_NAME,
            handler,
            registry.defaults().with_max_attempts(3),
        )
        .await
}

/// 添加清理作业; 持久化存储中已存在时更新其 cron 表达式
pub async fn schedule_retention_job(scheduler: &Scheduler, cron_expr: &str) -> SchedulerResult<Job> {
    let job = Job::new(RETENTION_JOB_ID, Trigger::cron(cron_expr), RETENTION_TASK_NAME);
    match scheduler.add_job(job).await {
        Err(SchedulerError::DuplicateJob { .. }) => {
            scheduler
                .reschedule_job(RETENTION_JOB_ID, Trigger::cron(cron_expr))
                .await
        }
        other => other,
    }
}

/// 按配置注册清理任务并添加对应的调度作业
pub async fn install_retention(
    registry: &TaskRegistry,
    tracker: Arc<dyn ExecutionTracker>,
    scheduler: &Scheduler,
    config: &TrackerConfig,
) -> SchedulerResult<Job> {
    register_retention_task(registry, tracker, config.retention_days).await?;
    schedule_retention_job(scheduler, &config.cleanup_cron).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_core::{
        models::{ExecutionStatus, TaskMessage, TransitionMetadata},
        traits::TaskHandler,
    };
    use scheduler_infrastructure::{DatabaseManager, SqliteExecutionTracker};
    use serde_json::Map;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn test_retention_task_deletes_old_records() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let tracker: Arc<dyn ExecutionTracker> =
            Arc::new(SqliteExecutionTracker::new(db.pool().clone()));

        let old = Utc::now() - Duration::days(40);
        tracker
            .record_transition(
                "old",
                ExecutionStatus::Success,
                TransitionMetadata::new("report", 1).at(old),
            )
            .await
            .unwrap();
        tracker
            .record_transition(
                "fresh",
                ExecutionStatus::Pending,
                TransitionMetadata::new("report", 1),
            )
            .await
            .unwrap();

        let registry = TaskRegistry::new();
        register_retention_task(&registry, tracker.clone(), 30)
            .await
            .unwrap();
        let task = registry.get(RETENTION_TASK_NAME).await.unwrap();
        assert_eq!(task.options.max_attempts, 3);

        let message = TaskMessage::new(RETENTION_TASK_NAME, vec![], Map::new());
        let value = task
            .handler
            .handle(
                TaskContext::new(&message, 3, StdDuration::from_secs(5)),
                TaskArgs::from_message(&message),
            )
            .await
            .unwrap();

        assert_eq!(value, json!({"deleted": 1}));
        assert!(tracker.get_execution("old").await.unwrap().is_none());
        assert!(tracker.get_execution("fresh").await.unwrap().is_some());
    }
}
