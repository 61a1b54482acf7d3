use std::time::Duration;

use async_trait::async_trait;

use crate::{models::Job, SchedulerResult};

/// 作业存储接口
#[async_trait]
pub trait JobStore: Send + Sync {
    /// 新增作业, id 重复时返回 `DuplicateJob`
    async fn add_job(&self, job: &Job) -> SchedulerResult<()>;

    /// 覆盖已有作业, 不存在时返回 `JobNotFound`
    async fn update_job(&self, job: &Job) -> SchedulerResult<()>;

    async fn remove_job(&self, id: &str) -> SchedulerResult<()>;

    async fn get_job(&self, id: &str) -> SchedulerResult<Option<Job>>;

    async fn list_jobs(&self) -> SchedulerResult<Vec<Job>>;

    /// 获取或续期调度器租约
    ///
    /// 同一时刻只有一个持有者能评估触发器，避免多个调度器实例重复触发。
    async fn try_acquire_lease(&self, holder: &str, ttl: Duration) -> SchedulerResult<bool>;

    async fn release_lease(&self, holder: &str) -> SchedulerResult<()>;
}
