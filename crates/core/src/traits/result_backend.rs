use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{models::TaskResult, SchedulerError, SchedulerResult};

/// 结果后端接口
///
/// 部署时二选一：键值存储 (TTL 自动过期) 或关系型存储 (显式清理)，
/// 同一部署内不会混用。
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// 保存任务结果, `ttl` 之后不再可读
    async fn store(&self, task_id: &str, result: &TaskResult, ttl: Duration) -> SchedulerResult<()>;

    /// 读取任务结果, 不存在或已过期时返回 [`SchedulerError::ResultNotFound`]
    async fn fetch(&self, task_id: &str) -> SchedulerResult<TaskResult>;

    /// 删除任务结果, 返回是否存在
    async fn delete(&self, task_id: &str) -> SchedulerResult<bool>;

    /// 清理过期结果, 返回清理条数
    async fn cleanup_expired(&self) -> SchedulerResult<u64> {
        Ok(0)
    }

    async fn is_healthy(&self) -> bool;

    fn backend_name(&self) -> &'static str;

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(100)
    }

    /// 轮询直到结果可用
    ///
    /// 超时返回 [`SchedulerError::ResultNotReady`]，不会返回默认值。
    async fn wait_result(&self, task_id: &str, timeout: Duration) -> SchedulerResult<TaskResult> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.fetch(task_id).await {
                Ok(result) => return Ok(result),
                Err(SchedulerError::ResultNotFound { .. }) => {}
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SchedulerError::ResultNotReady {
                    task_id: task_id.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(self.poll_interval().min(deadline - now)).await;
        }
    }
}
