use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{models::Job, traits::JobStore, SchedulerError, SchedulerResult};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::database::to_millis;

const LEASE_NAME: &str = "scheduler";

/// 持久化作业存储
///
/// 每个作业一行，完整定义以 JSON 存于 `payload`，进程重启后调度计划不会丢失。
/// `scheduler_leases` 表提供单活调度器租约。
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn add_job(&self, job: &Job) -> SchedulerResult<()> {
        let payload = serde_json::to_string(job)?;
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (id, task_name, payload, next_run_time, paused, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&job.id)
        .bind(&job.task_name)
        .bind(payload)
        .bind(job.next_run_time.map(to_millis))
        .bind(job.paused)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(job_id = %job.id, "作业已持久化");
                Ok(())
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(SchedulerError::DuplicateJob { id: job.id.clone() })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_job(&self, job: &Job) -> SchedulerResult<()> {
        let payload = serde_json::to_string(job)?;
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET task_name = ?2, payload = ?3, next_run_time = ?4, paused = ?5, updated_at = ?6
            WHERE id = ?1
            "#,
        )
        .bind(&job.id)
        .bind(&job.task_name)
        .bind(payload)
        .bind(job.next_run_time.map(to_millis))
        .bind(job.paused)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::JobNotFound { id: job.id.clone() });
        }
        Ok(())
    }

    async fn remove_job(&self, id: &str) -> SchedulerResult<()> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> SchedulerResult<Option<Job>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM scheduled_jobs WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(payload.map(|p| serde_json::from_str(&p)).transpose()?)
    }

    async fn list_jobs(&self) -> SchedulerResult<Vec<Job>> {
        let payloads: Vec<String> =
            sqlx::query_scalar("SELECT payload FROM scheduled_jobs ORDER BY id")
                .fetch_all(&self.pool)
                .await?;

        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(SchedulerError::from))
            .collect()
    }

    async fn try_acquire_lease(&self, holder: &str, ttl: Duration) -> SchedulerResult<bool> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SchedulerError::Lease(format!("无效的租约时长: {e}")))?;

        let result = sqlx::query(
            r#"
            INSERT INTO scheduler_leases (name, holder, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE scheduler_leases.holder = excluded.holder
               OR scheduler_leases.expires_at <= ?4
            "#,
        )
        .bind(LEASE_NAME)
        .bind(holder)
        .bind(to_millis(now + ttl))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| SchedulerError::Lease(format!("获取调度器租约失败: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, holder: &str) -> SchedulerResult<()> {
        let result = sqlx::query("DELETE FROM scheduler_leases WHERE name = ?1 AND holder = ?2")
            .bind(LEASE_NAME)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(|e| SchedulerError::Lease(format!("释放调度器租约失败: {e}")))?;

        if result.rows_affected() > 0 {
            info!(holder = %holder, "调度器租约已释放");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use scheduler_core::models::Trigger;

    async fn store() -> SqliteJobStore {
        let db = DatabaseManager::in_memory().await.unwrap();
        SqliteJobStore::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_job_crud() {
        let store = store().await;
        let mut job = Job::new("cleanup", Trigger::cron("0 2 * * *"), "cleanup_task");
        job.next_run_time = Some(Utc::now());

        store.add_job(&job).await.unwrap();
        assert!(matches!(
            store.add_job(&job).await,
            Err(SchedulerError::DuplicateJob { .. })
        ));

        job.paused = true;
        store.update_job(&job).await.unwrap();
        let loaded = store.get_job("cleanup").await.unwrap().unwrap();
        assert!(loaded.paused);
        assert_eq!(loaded.trigger, Trigger::cron("0 2 * * *"));

        assert_eq!(store.list_jobs().await.unwrap().len(), 1);

        store.remove_job("cleanup").await.unwrap();
        assert!(store.get_job("cleanup").await.unwrap().is_none());
        assert!(matches!(
            store.remove_job("cleanup").await,
            Err(SchedulerError::JobNotFound { .. })
        ));
        assert!(matches!(
            store.update_job(&job).await,
            Err(SchedulerError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = scheduler_core::config::DatabaseConfig {
            url: format!("sqlite://{}?mode=rwc", dir.path().join("jobs.db").display()),
            ..Default::default()
        };

        {
            let db = DatabaseManager::new(&config).await.unwrap();
            let store = SqliteJobStore::new(db.pool().clone());
            store
                .add_job(&Job::new("hourly", Trigger::interval(3600), "report"))
                .await
                .unwrap();
            db.close().await;
        }

        let db = DatabaseManager::new(&config).await.unwrap();
        let store = SqliteJobStore::new(db.pool().clone());
        let jobs = store.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "hourly");
        db.close().await;
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_released_or_expired() {
        let store = store().await;
        let ttl = Duration::from_secs(30);

        assert!(store.try_acquire_lease("a", ttl).await.unwrap());
        // 持有者可以续期
        assert!(store.try_acquire_lease("a", ttl).await.unwrap());
        assert!(!store.try_acquire_lease("b", ttl).await.unwrap());

        store.release_lease("a").await.unwrap();
        assert!(store.try_acquire_lease("b", ttl).await.unwrap());

        // 过期租约可被接管
        assert!(store
            .try_acquire_lease("b", Duration::from_millis(1))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(store.try_acquire_lease("a", ttl).await.unwrap());
    }
}
