use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{
    models::TaskResult, traits::ResultBackend, SchedulerError, SchedulerResult,
};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::database::to_millis;

/// 关系型结果后端
///
/// 结果持久化到 `task_results` 表，可与业务表联查；过期数据由
/// [`ResultBackend::cleanup_expired`] 显式清理，读取时同样过滤已过期的行。
pub struct SqliteResultBackend {
    pool: SqlitePool,
    poll_interval: Duration,
}

impl SqliteResultBackend {
    pub fn new(pool: SqlitePool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
        }
    }
}

#[async_trait]
impl ResultBackend for SqliteResultBackend {
    async fn store(&self, task_id: &str, result: &TaskResult, ttl: Duration) -> SchedulerResult<()> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SchedulerError::ResultBackend(format!("无效的结果TTL: {e}")))?;
        let payload = serde_json::to_string(result)?;

        sqlx::query(
            r#"
            INSERT INTO task_results (task_id, task_name, is_err, payload, expires_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(task_id) DO UPDATE SET
                task_name = excluded.task_name,
                is_err = excluded.is_err,
                payload = excluded.payload,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(task_id)
        .bind(&result.task_name)
        .bind(result.is_err)
        .bind(payload)
        .bind(to_millis(now + ttl))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| SchedulerError::ResultBackend(format!("保存任务结果失败: {e}")))?;

        debug!(task_id = %task_id, "任务结果已保存");
        Ok(())
    }

    async fn fetch(&self, task_id: &str) -> SchedulerResult<TaskResult> {
        let payload: Option<String> = sqlx::query_scalar(
            "SELECT payload FROM task_results WHERE task_id = ?1 AND expires_at > ?2",
        )
        .bind(task_id)
        .bind(to_millis(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SchedulerError::ResultBackend(format!("读取任务结果失败: {e}")))?;

        match payload {
            Some(payload) => Ok(serde_json::from_str(&payload)?),
            None => Err(SchedulerError::ResultNotFound {
                task_id: task_id.to_string(),
            }),
        }
    }

    async fn delete(&self, task_id: &str) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM task_results WHERE task_id = ?1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .map_err(|e| SchedulerError::ResultBackend(format!("删除任务结果失败: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_expired(&self) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM task_results WHERE expires_at <= ?1")
            .bind(to_millis(Utc::now()))
            .execute(&self.pool)
            .await
            .map_err(|e| SchedulerError::ResultBackend(format!("清理过期结果失败: {e}")))?;
        Ok(result.rows_affected())
    }

    async fn is_healthy(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                warn!("结果后端健康检查失败: {}", e);
                false
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "database"
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use scheduler_core::models::TaskError;
    use serde_json::json;

    async fn backend() -> SqliteResultBackend {
        let db = DatabaseManager::in_memory().await.unwrap();
        SqliteResultBackend::new(db.pool().clone(), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_store_fetch_delete() {
        let backend = backend().await;
        let result = TaskResult::success("t1", "report", json!({"ok": true}));

        backend
            .store("t1", &result, Duration::from_secs(60))
            .await
            .unwrap();
        let fetched = backend.fetch("t1").await.unwrap();
        assert!(!fetched.is_err);
        assert_eq!(fetched.return_value, Some(json!({"ok": true})));

        assert!(backend.delete("t1").await.unwrap());
        assert!(!backend.delete("t1").await.unwrap());
        assert!(matches!(
            backend.fetch("t1").await,
            Err(SchedulerError::ResultNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_store_overwrites_previous_result() {
        let backend = backend().await;
        backend
            .store(
                "t1",
                &TaskResult::failure("t1", "report", TaskError::transient("boom")),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        backend
            .store(
                "t1",
                &TaskResult::success("t1", "report", json!(1)),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(backend.fetch("t1").await.unwrap().into_result(), Ok(json!(1)));
    }

    #[tokio::test]
    async fn test_expired_results_are_hidden_and_cleaned() {
        let backend = backend().await;
        backend
            .store(
                "short",
                &TaskResult::success("short", "report", json!(null)),
                Duration::from_millis(1),
            )
            .await
            .unwrap();
        backend
            .store(
                "long",
                &TaskResult::success("long", "report", json!(null)),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            backend.fetch("short").await,
            Err(SchedulerError::ResultNotFound { .. })
        ));
        assert_eq!(backend.cleanup_expired().await.unwrap(), 1);
        assert!(backend.fetch("long").await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_result_times_out_then_succeeds() {
        let backend = std::sync::Arc::new(backend().await);

        let err = backend
            .wait_result("t1", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ResultNotReady { .. }));

        let writer = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer
                .store(
                    "t1",
                    &TaskResult::success("t1", "report", json!({"ok": true})),
                    Duration::from_secs(60),
                )
                .await
                .unwrap();
        });

        let result = backend
            .wait_result("t1", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result.return_value, Some(json!({"ok": true})));
    }
}
