use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::{
    models::{ExecutionQuery, ExecutionRecord, ExecutionStatus, Page, TaskError, TransitionMetadata},
    traits::ExecutionTracker,
    SchedulerResult,
};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};

use crate::database::{from_millis, from_optional_millis, to_millis};

const RECORD_COLUMNS: &str = "task_id, task_name, status, attempt_count, started_at, completed_at, \
     duration_ms, error, args_snapshot, created_at, updated_at";

/// 基于 SQLite 的执行追踪器
///
/// 状态合并在单条 UPSERT 语句内完成，同一 task_id 的并发写入不需要额外加锁：
/// - 终态记录不再更新
/// - `attempt_count` 取较大值
/// - `started_at` 保留第一次进入 running 的时间
pub struct SqliteExecutionTracker {
    pool: SqlitePool,
}

impl SqliteExecutionTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &SqliteRow) -> SchedulerResult<ExecutionRecord> {
        let error: Option<String> = row.try_get("error")?;
        let args_snapshot: Option<String> = row.try_get("args_snapshot")?;
        let attempt_count: i64 = row.try_get("attempt_count")?;

        Ok(ExecutionRecord {
            task_id: row.try_get("task_id")?,
            task_name: row.try_get("task_name")?,
            status: row.try_get("status")?,
            attempt_count: attempt_count.clamp(0, i64::from(u32::MAX)) as u32,
            started_at: from_optional_millis(row.try_get("started_at")?)?,
            completed_at: from_optional_millis(row.try_get("completed_at")?)?,
            duration_ms: row.try_get("duration_ms")?,
            error: error
                .map(|e| serde_json::from_str::<TaskError>(&e))
                .transpose()?,
            args_snapshot: args_snapshot
                .map(|a| serde_json::from_str::<Value>(&a))
                .transpose()?,
            created_at: from_millis(row.try_get("created_at")?)?,
            updated_at: from_millis(row.try_get("updated_at")?)?,
        })
    }

    fn push_filters<'a>(builder: &mut QueryBuilder<'a, Sqlite>, query: &'a ExecutionQuery) {
        builder.push(" WHERE 1 = 1");
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(task_name) = &query.task_name {
            builder.push(" AND task_name = ").push_bind(task_name.as_str());
        }
        if let Some(start) = query.start {
            builder
                .push(" AND COALESCE(started_at, created_at) >= ")
                .push_bind(to_millis(start));
        }
        if let Some(end) = query.end {
            builder
                .push(" AND COALESCE(started_at, created_at) <= ")
                .push_bind(to_millis(end));
        }
    }
}

#[async_trait]
impl ExecutionTracker for SqliteExecutionTracker {
    #[instrument(skip(self, metadata), fields(task_name = %metadata.task_name, attempt = metadata.attempt))]
    async fn record_transition(
        &self,
        task_id: &str,
        status: ExecutionStatus,
        metadata: TransitionMetadata,
    ) -> SchedulerResult<bool> {
        let at = to_millis(metadata.at);
        let finished = matches!(
            status,
            ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::DeadLettered
        );
        let started_at = (status == ExecutionStatus::Running).then_some(at);
        let completed_at = finished.then_some(at);
        let error = metadata
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let args_snapshot = metadata
            .args_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO task_executions (task_id, task_name, status, attempt_count, started_at,
                                         completed_at, duration_ms, error, args_snapshot,
                                         created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?9, ?9)
            ON CONFLICT(task_id) DO UPDATE SET
                status = excluded.status,
                attempt_count = MAX(task_executions.attempt_count, excluded.attempt_count),
                started_at = COALESCE(task_executions.started_at, excluded.started_at),
                completed_at = CASE
                    WHEN ?10 THEN excluded.completed_at
                    WHEN excluded.status = 'running' THEN NULL
                    ELSE task_executions.completed_at
                END,
                duration_ms = CASE
                    WHEN ?10 THEN excluded.completed_at
                        - COALESCE(task_executions.started_at, excluded.completed_at)
                    WHEN excluded.status = 'running' THEN NULL
                    ELSE task_executions.duration_ms
                END,
                error = CASE
                    WHEN excluded.status = 'success' THEN NULL
                    ELSE COALESCE(excluded.error, task_executions.error)
                END,
                args_snapshot = COALESCE(task_executions.args_snapshot, excluded.args_snapshot),
                updated_at = excluded.updated_at
            WHERE task_executions.status NOT IN ('success', 'dead_lettered')
            "#,
        )
        .bind(task_id)
        .bind(&metadata.task_name)
        .bind(status)
        .bind(i64::from(metadata.attempt))
        .bind(started_at)
        .bind(completed_at)
        .bind(error)
        .bind(args_snapshot)
        .bind(at)
        .bind(finished)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if !applied {
            debug!(task_id = %task_id, status = %status, "执行记录已处于终态, 忽略状态迁移");
        }
        Ok(applied)
    }

    async fn get_execution(&self, task_id: &str) -> SchedulerResult<Option<ExecutionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM task_executions WHERE task_id = ?1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list_executions(&self, query: &ExecutionQuery) -> SchedulerResult<Page<ExecutionRecord>> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM task_executions");
        Self::push_filters(&mut count, query);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select =
            QueryBuilder::<Sqlite>::new(format!("SELECT {RECORD_COLUMNS} FROM task_executions"));
        Self::push_filters(&mut select, query);
        select
            .push(" ORDER BY COALESCE(started_at, created_at) DESC, task_id ASC LIMIT ")
            .push_bind(i64::from(query.page_size))
            .push(" OFFSET ")
            .push_bind(i64::try_from(query.offset()).unwrap_or(i64::MAX));

        let rows = select.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(Self::row_to_record)
            .collect::<SchedulerResult<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
            page: query.page,
            page_size: query.page_size,
        })
    }

    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM task_executions WHERE updated_at < ?1")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await?;

        debug!(deleted = result.rows_affected(), cutoff = %cutoff, "已清理过期执行记录");
        Ok(result.rows_affected())
    }
}
