//! 定时调度器: 作业存储之上的触发器评估、错过触发处理与任务消息发布。

pub mod cron_utils;
pub mod retention;
pub mod scheduler;
pub mod triggers;

pub use cron_utils::CronScheduler;
pub use retention::{install_retention, RETENTION_JOB_ID, RETENTION_TASK_NAME};
pub use scheduler::{FiredJob, Scheduler, TickReport};
pub use triggers::FireTimes;
