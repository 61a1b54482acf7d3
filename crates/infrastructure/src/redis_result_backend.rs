use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use scheduler_core::{
    config::ResultBackendConfig, models::TaskResult, traits::ResultBackend, SchedulerError,
    SchedulerResult,
};
use tracing::{debug, warn};

fn backend_error(context: &str, e: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::ResultBackend(format!("{context}: {e}"))
}

/// 基于 Redis 的结果后端
///
/// 结果以 `{key_prefix}{task_id}` 为键写入并设置毫秒级过期时间，由 Redis 自动淘汰。
/// [`ConnectionManager`] 在断线后自动重连，克隆后可在多个任务间并发使用。
pub struct RedisResultBackend {
    connection: ConnectionManager,
    key_prefix: String,
    poll_interval: Duration,
}

impl RedisResultBackend {
    pub async fn new(config: &ResultBackendConfig) -> SchedulerResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| backend_error("创建Redis客户端失败", e))?;
        let connection = tokio::time::timeout(
            Duration::from_secs(10),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| SchedulerError::ResultBackend("连接Redis超时".to_string()))?
        .map_err(|e| backend_error("连接Redis失败", e))?;

        debug!("已连接Redis结果后端");
        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
            poll_interval: config.poll_interval(),
        })
    }

    fn key(&self, task_id: &str) -> String {
        format!("{}{}", self.key_prefix, task_id)
    }
}

#[async_trait]
impl ResultBackend for RedisResultBackend {
    async fn store(&self, task_id: &str, result: &TaskResult, ttl: Duration) -> SchedulerResult<()> {
        let payload = serde_json::to_string(result)?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let mut conn = self.connection.clone();
        let _: () = conn
            .pset_ex(self.key(task_id), payload, ttl_ms)
            .await
            .map_err(|e| backend_error("保存任务结果失败", e))?;
        Ok(())
    }

    async fn fetch(&self, task_id: &str) -> SchedulerResult<TaskResult> {
        let mut conn = self.connection.clone();
        let payload: Option<String> = conn
            .get(self.key(task_id))
            .await
            .map_err(|e| backend_error("读取任务结果失败", e))?;

        match payload {
            Some(payload) => Ok(serde_json::from_str(&payload)?),
            None => Err(SchedulerError::ResultNotFound {
                task_id: task_id.to_string(),
            }),
        }
    }

    async fn delete(&self, task_id: &str) -> SchedulerResult<bool> {
        let mut conn = self.connection.clone();
        let deleted: u64 = conn
            .del(self.key(task_id))
            .await
            .map_err(|e| backend_error("删除任务结果失败", e))?;
        Ok(deleted > 0)
    }

    async fn is_healthy(&self) -> bool {
        let mut conn = self.connection.clone();
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(response) => response == "PONG",
            Err(e) => {
                warn!("Redis结果后端健康检查失败: {}", e);
                false
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use testcontainers_modules::{redis::Redis, testcontainers::runners::AsyncRunner};

    #[tokio::test]
    #[ignore = "需要 Docker"]
    async fn test_redis_result_backend() {
        let container = Redis::default().start().await.unwrap();
        let port = container.get_host_port_ipv4(6379).await.unwrap();
        let config = ResultBackendConfig {
            url: format!("redis://127.0.0.1:{port}"),
            poll_interval_ms: 10,
            ..Default::default()
        };

        let backend = RedisResultBackend::new(&config).await.unwrap();
        assert!(backend.is_healthy().await);

        let result = TaskResult::success("t1", "report", json!({"ok": true}));
        backend
            .store("t1", &result, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(backend.fetch("t1").await.unwrap(), result);

        assert!(backend.delete("t1").await.unwrap());
        assert!(matches!(
            backend.fetch("t1").await,
            Err(SchedulerError::ResultNotFound { .. })
        ));

        backend
            .store("short", &result, Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(
            backend.wait_result("short", Duration::from_millis(50)).await,
            Err(SchedulerError::ResultNotReady { .. })
        ));
    }
}
