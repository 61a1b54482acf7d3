use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    models::{ExecutionQuery, ExecutionRecord, ExecutionStatus, Page, TransitionMetadata},
    SchedulerResult,
};

/// 执行追踪器接口
///
/// 独立于结果后端，保存每个 task_id 的逐次尝试历史。
#[async_trait]
pub trait ExecutionTracker: Send + Sync {
    /// 记录状态迁移
    ///
    /// 记录不存在时创建。已处于终态的记录不会再变化，此时返回 `Ok(false)`。
    /// `attempt_count` 只增不减。
    async fn record_transition(
        &self,
        task_id: &str,
        status: ExecutionStatus,
        metadata: TransitionMetadata,
    ) -> SchedulerResult<bool>;

    async fn get_execution(&self, task_id: &str) -> SchedulerResult<Option<ExecutionRecord>>;

    /// 分页查询, 默认按 started_at 倒序
    async fn list_executions(&self, query: &ExecutionQuery) -> SchedulerResult<Page<ExecutionRecord>>;

    /// 删除早于 `cutoff` 的记录, 返回删除条数
    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64>;
}
