use std::sync::Arc;
use std::time::Duration;

use scheduler_core::{
    models::{ExecutionQuery, ExecutionRecord, Page, TaskMessage, TaskResult},
    traits::{ExecutionTracker, MessageQueue, ResultBackend},
    SchedulerError, SchedulerResult,
};
use serde_json::{Map, Value};
use tracing::Instrument;

use crate::observability::{CrossComponentTracer, StructuredLogger, TaskTracer};

/// 入队返回的任务句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub task_id: String,
    pub queue: String,
}

/// 入队、结果等待与执行历史查询
///
/// 调度器与业务代码共用同一个客户端, 因而共享同一个 broker 连接池。
#[derive(Clone)]
pub struct TaskClient {
    broker: Arc<dyn MessageQueue>,
    results: Arc<dyn ResultBackend>,
    tracker: Arc<dyn ExecutionTracker>,
    default_queue: String,
    publish_timeout: Duration,
}

impl TaskClient {
    pub fn new(
        broker: Arc<dyn MessageQueue>,
        results: Arc<dyn ResultBackend>,
        tracker: Arc<dyn ExecutionTracker>,
        default_queue: impl Into<String>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            results,
            tracker,
            default_queue: default_queue.into(),
            publish_timeout,
        }
    }

    pub fn with_publish_timeout(mut self, publish_timeout: Duration) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    /// 入队, 不等待执行
    ///
    /// 幂等键原样写入消息头, 去重由处理函数负责。
    pub async fn enqueue(
        &self,
        task_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        idempotency_key: Option<String>,
    ) -> SchedulerResult<TaskHandle> {
        let mut message = TaskMessage::new(task_name, args, kwargs);
        if let Some(key) = idempotency_key {
            message = message.with_idempotency_key(key);
        }
        let queue = self.default_queue.clone();
        self.enqueue_message(&queue, message).await
    }

    /// 发布一条已构造的消息, 当前 span 的链路上下文会写入消息头
    pub async fn enqueue_message(
        &self,
        queue: &str,
        mut message: TaskMessage,
    ) -> SchedulerResult<TaskHandle> {
        let span = TaskTracer::enqueue_span(&message.task_name, queue);
        async {
            CrossComponentTracer::inject_current_context(&mut message.headers.trace_context);

            tokio::time::timeout(
                self.publish_timeout,
                self.broker.publish_message(queue, &message),
            )
            .await
            .map_err(|_| {
                SchedulerError::Timeout(format!(
                    "发布任务 {} 超过 {}ms",
                    message.task_name,
                    self.publish_timeout.as_millis()
                ))
            })??;

            StructuredLogger::log_task_enqueued(&message, queue);
            Ok(TaskHandle {
                task_id: message.task_id.clone(),
                queue: queue.to_string(),
            })
        }
        .instrument(span)
        .await
    }

    /// 等待任务最终结果, 超时返回 [`SchedulerError::ResultNotReady`]
    pub async fn wait_result(&self, task_id: &str, timeout: Duration) -> SchedulerResult<TaskResult> {
        self.results.wait_result(task_id, timeout).await
    }

    pub async fn get_execution(&self, task_id: &str) -> SchedulerResult<Option<ExecutionRecord>> {
        self.tracker.get_execution(task_id).await
    }

    pub async fn list_executions(
        &self,
        query: &ExecutionQuery,
    ) -> SchedulerResult<Page<ExecutionRecord>> {
        self.tracker.list_executions(query).await
    }

    pub async fn queue_size(&self, queue: &str) -> SchedulerResult<u32> {
        self.broker.get_queue_size(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::{DatabaseManager, SqliteExecutionTracker, SqliteResultBackend},
        in_memory_queue::InMemoryMessageQueue,
    };
    use serde_json::json;

    async fn client() -> (TaskClient, InMemoryMessageQueue) {
        let db = DatabaseManager::in_memory().await.unwrap();
        let broker = InMemoryMessageQueue::new();
        let client = TaskClient::new(
            Arc::new(broker.clone()),
            Arc::new(SqliteResultBackend::new(
                db.pool().clone(),
                Duration::from_millis(10),
            )),
            Arc::new(SqliteExecutionTracker::new(db.pool().clone())),
            "tasks",
            Duration::from_secs(1),
        );
        (client, broker)
    }

    #[tokio::test]
    async fn test_enqueue_publishes_message() {
        let (client, broker) = client().await;

        let handle = client
            .enqueue("send_report", vec![json!(42)], Map::new(), None)
            .await
            .unwrap();
        assert_eq!(handle.queue, "tasks");
        assert_eq!(client.queue_size("tasks").await.unwrap(), 1);

        let messages = broker.peek_messages("tasks").await;
        assert_eq!(messages[0].task_id, handle.task_id);
        assert_eq!(messages[0].task_name, "send_report");
        assert_eq!(messages[0].args, vec![json!(42)]);
        assert_eq!(messages[0].attempt(), 1);
    }

    #[tokio::test]
    async fn test_idempotency_key_is_passed_through() {
        let (client, broker) = client().await;

        let first = client
            .enqueue("charge", vec![], Map::new(), Some("order-1".to_string()))
            .await
            .unwrap();
        let second = client
            .enqueue("charge", vec![], Map::new(), Some("order-1".to_string()))
            .await
            .unwrap();

        assert_ne!(first.task_id, second.task_id);
        let messages = broker.peek_messages("tasks").await;
        assert_eq!(messages.len(), 2);
        assert!(messages
            .iter()
            .all(|m| m.headers.idempotency_key.as_deref() == Some("order-1")));
    }

    #[tokio::test]
    async fn test_wait_result_without_result_times_out() {
        let (client, _broker) = client().await;
        let err = client
            .wait_result("missing", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ResultNotReady { .. }));
    }
}
