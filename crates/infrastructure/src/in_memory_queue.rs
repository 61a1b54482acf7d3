use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use scheduler_core::{
    models::{dead_letter_queue_name, TaskMessage},
    traits::{Acknowledger, Delivery, DeliveryStream, MessageQueue},
    SchedulerError, SchedulerResult,
};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// 内存消息队列配置
#[derive(Debug, Clone)]
pub struct InMemoryQueueConfig {
    /// 单个队列最大容量（0表示无限制）
    pub max_queue_size: usize,
    /// 死信队列后缀
    pub dead_letter_suffix: String,
}

impl Default for InMemoryQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100_000,
            dead_letter_suffix: ".dlq".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<TaskMessage>,
    notify: Arc<Notify>,
}

#[derive(Debug)]
struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    config: InMemoryQueueConfig,
    unacked: AtomicUsize,
    peak_unacked: AtomicUsize,
    closed: AtomicBool,
}

impl Inner {
    async fn push(&self, queue: &str, message: TaskMessage) -> SchedulerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SchedulerError::MessageQueue("内存队列已关闭".to_string()));
        }

        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        if self.config.max_queue_size > 0 && state.ready.len() >= self.config.max_queue_size {
            return Err(SchedulerError::MessageQueue(format!(
                "队列 {queue} 已满 ({})",
                self.config.max_queue_size
            )));
        }
        state.ready.push_back(message);
        state.notify.notify_one();
        Ok(())
    }

    fn delivered(&self) {
        let current = self.unacked.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_unacked.fetch_max(current, Ordering::SeqCst);
    }

    fn settled(&self) {
        self.unacked.fetch_sub(1, Ordering::SeqCst);
    }

    fn dead_letter_queue(&self, queue: &str) -> String {
        dead_letter_queue_name(queue, &self.config.dead_letter_suffix)
    }
}

/// 内存消息队列实现
///
/// 进程内的队列，提供与 RabbitMQ 实现相同的 ack/nack/prefetch/死信语义，
/// 适用于嵌入式部署与测试。消息不会在进程重启后保留。
#[derive(Debug, Clone)]
pub struct InMemoryMessageQueue {
    inner: Arc<Inner>,
}

impl InMemoryMessageQueue {
    /// 创建新的内存消息队列实例
    pub fn new() -> Self {
        Self::with_config(InMemoryQueueConfig::default())
    }

    /// 使用指定配置创建内存消息队列实例
    pub fn with_config(config: InMemoryQueueConfig) -> Self {
        info!("创建内存消息队列: {:?}", config);
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                config,
                unacked: AtomicUsize::new(0),
                peak_unacked: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// 当前已投递但未确认的消息数量
    pub fn outstanding_unacked(&self) -> usize {
        self.inner.unacked.load(Ordering::SeqCst)
    }

    /// 历史最高的未确认消息数量
    pub fn peak_unacked(&self) -> usize {
        self.inner.peak_unacked.load(Ordering::SeqCst)
    }

    /// 查看队列中待投递的消息, 不出队
    pub async fn peek_messages(&self, queue: &str) -> Vec<TaskMessage> {
        let queues = self.inner.queues.lock().await;
        queues
            .get(queue)
            .map(|state| state.ready.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryMessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// 单条投递的确认句柄
///
/// 未确认就被丢弃时（消费者崩溃）消息重新入队，对应 broker 的确认超时重投。
struct InMemoryAcker {
    inner: Arc<Inner>,
    queue: String,
    message: TaskMessage,
    settled: AtomicBool,
    _permit: OwnedSemaphorePermit,
}

impl InMemoryAcker {
    /// 返回 false 表示已经确认过
    fn settle(&self) -> bool {
        if self.settled.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.settled();
        true
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> SchedulerResult<()> {
        self.settle();
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> SchedulerResult<()> {
        if !self.settle() {
            return Ok(());
        }
        if requeue {
            self.inner.push(&self.queue, self.message.clone()).await
        } else {
            let dlq = self.inner.dead_letter_queue(&self.queue);
            self.inner.push(&dlq, self.message.clone()).await
        }
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        if !self.settle() {
            return;
        }
        warn!(
            queue = %self.queue,
            task_id = %self.message.task_id,
            "投递未确认即被丢弃, 重新入队"
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            let queue = self.queue.clone();
            let message = self.message.clone();
            handle.spawn(async move {
                if let Err(e) = inner.push(&queue, message).await {
                    warn!(queue = %queue, error = %e, "重新入队失败");
                }
            });
        }
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish_message(&self, queue: &str, message: &TaskMessage) -> SchedulerResult<()> {
        self.inner.push(queue, message.clone()).await?;
        debug!(queue = %queue, task_id = %message.task_id, "消息已发布到内存队列");
        Ok(())
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        message: &TaskMessage,
        delay: Duration,
    ) -> SchedulerResult<()> {
        if delay.is_zero() {
            return self.publish_message(queue, message).await;
        }

        let inner = Arc::clone(&self.inner);
        let queue = queue.to_string();
        let message = message.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = inner.push(&queue, message).await {
                warn!(queue = %queue, error = %e, "延迟消息投递失败");
            }
        });
        Ok(())
    }

    async fn publish_dead_letter(&self, queue: &str, message: &TaskMessage) -> SchedulerResult<()> {
        let dlq = self.inner.dead_letter_queue(queue);
        self.inner.push(&dlq, message.clone()).await
    }

    async fn consume(&self, queue: &str, prefetch_count: u16) -> SchedulerResult<DeliveryStream> {
        if prefetch_count == 0 {
            return Err(SchedulerError::MessageQueue(
                "prefetch_count 必须大于0".to_string(),
            ));
        }
        self.create_queue(queue, true).await?;

        let prefetch = Arc::new(Semaphore::new(prefetch_count as usize));
        let state = (Arc::clone(&self.inner), queue.to_string(), prefetch);

        let deliveries = stream::unfold(state, |(inner, queue, prefetch)| async move {
            let permit = Arc::clone(&prefetch).acquire_owned().await.ok()?;
            loop {
                if inner.closed.load(Ordering::SeqCst) {
                    return None;
                }

                let next = {
                    let mut queues = inner.queues.lock().await;
                    let state = queues.entry(queue.clone()).or_default();
                    match state.ready.pop_front() {
                        Some(message) => Ok(message),
                        None => Err(Arc::clone(&state.notify)),
                    }
                };

                match next {
                    Ok(message) => {
                        inner.delivered();
                        let acker = InMemoryAcker {
                            inner: Arc::clone(&inner),
                            queue: queue.clone(),
                            message: message.clone(),
                            settled: AtomicBool::new(false),
                            _permit: permit,
                        };
                        let delivery = Delivery::new(queue.clone(), message, Box::new(acker));
                        return Some((
                            Ok::<_, SchedulerError>(delivery),
                            (inner, queue, prefetch),
                        ));
                    }
                    Err(notify) => notify.notified().await,
                }
            }
        });

        Ok(Box::pin(deliveries))
    }

    async fn create_queue(&self, queue: &str, _durable: bool) -> SchedulerResult<()> {
        let dlq = self.inner.dead_letter_queue(queue);
        let mut queues = self.inner.queues.lock().await;
        queues.entry(queue.to_string()).or_default();
        queues.entry(dlq).or_default();
        Ok(())
    }

    async fn get_queue_size(&self, queue: &str) -> SchedulerResult<u32> {
        let queues = self.inner.queues.lock().await;
        Ok(queues.get(queue).map(|s| s.ready.len() as u32).unwrap_or(0))
    }

    async fn purge_queue(&self, queue: &str) -> SchedulerResult<()> {
        let mut queues = self.inner.queues.lock().await;
        if let Some(state) = queues.get_mut(queue) {
            state.ready.clear();
        }
        debug!("队列 {} 已清空", queue);
        Ok(())
    }

    fn dead_letter_queue(&self, queue: &str) -> String {
        self.inner.dead_letter_queue(queue)
    }

    async fn is_healthy(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> SchedulerResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let queues = self.inner.queues.lock().await;
        for state in queues.values() {
            state.notify.notify_waiters();
            state.notify.notify_one();
        }
        info!("内存消息队列已关闭");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::Map;

    fn message(name: &str) -> TaskMessage {
        TaskMessage::new(name, vec![], Map::new())
    }

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let queue = InMemoryMessageQueue::new();
        queue.publish_message("tasks", &message("a")).await.unwrap();
        queue.publish_message("tasks", &message("b")).await.unwrap();
        assert_eq!(queue.get_queue_size("tasks").await.unwrap(), 2);

        let mut stream = queue.consume("tasks", 10).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.message.task_name, "a");
        assert_eq!(second.message.task_name, "b");
        assert_eq!(queue.outstanding_unacked(), 2);

        assert!(first.ack().await.unwrap());
        assert!(!first.ack().await.unwrap());
        assert!(second.ack().await.unwrap());
        assert_eq!(queue.outstanding_unacked(), 0);
        assert_eq!(queue.get_queue_size("tasks").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unacked() {
        let queue = InMemoryMessageQueue::new();
        for i in 0..5 {
            queue
                .publish_message("tasks", &message(&format!("t{i}")))
                .await
                .unwrap();
        }

        let mut stream = queue.consume("tasks", 2).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let _second = stream.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err(), "第三条消息不应在确认前投递");

        first.ack().await.unwrap();
        let third = tokio::time::timeout(Duration::from_millis(200), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(third.message.task_name, "t2");
        assert_eq!(queue.peak_unacked(), 2);
    }

    #[tokio::test]
    async fn test_nack_requeue_and_dead_letter() {
        let queue = InMemoryMessageQueue::new();
        queue.publish_message("tasks", &message("a")).await.unwrap();
        queue.publish_message("tasks", &message("b")).await.unwrap();

        let mut stream = queue.consume("tasks", 10).await.unwrap();
        let a = stream.next().await.unwrap().unwrap();
        a.nack(true).await.unwrap();

        let b = stream.next().await.unwrap().unwrap();
        assert_eq!(b.message.task_name, "b");
        b.nack(false).await.unwrap();

        let redelivered = stream.next().await.unwrap().unwrap();
        assert_eq!(redelivered.message.task_name, "a");
        redelivered.ack().await.unwrap();

        let dead = queue.peek_messages("tasks.dlq").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].task_name, "b");
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_redelivered() {
        let queue = InMemoryMessageQueue::new();
        queue.publish_message("tasks", &message("crash")).await.unwrap();

        {
            let mut stream = queue.consume("tasks", 1).await.unwrap();
            let delivery = stream.next().await.unwrap().unwrap();
            assert_eq!(delivery.message.task_name, "crash");
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.outstanding_unacked(), 0);
        assert_eq!(queue.get_queue_size("tasks").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delayed_publish() {
        let queue = InMemoryMessageQueue::new();
        queue
            .publish_delayed("tasks", &message("later"), Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(queue.get_queue_size("tasks").await.unwrap(), 0);

        let mut stream = queue.consume("tasks", 1).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message.task_name, "later");
    }

    #[tokio::test]
    async fn test_close_ends_stream_and_health() {
        let queue = InMemoryMessageQueue::new();
        let mut stream = queue.consume("tasks", 1).await.unwrap();
        assert!(queue.is_healthy().await);

        let waiter = tokio::spawn(async move { stream.next().await.is_none() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await.unwrap();

        assert!(waiter.await.unwrap());
        assert!(!queue.is_healthy().await);
        assert!(queue.publish_message("tasks", &message("x")).await.is_err());
    }

    #[tokio::test]
    async fn test_queue_capacity() {
        let queue = InMemoryMessageQueue::with_config(InMemoryQueueConfig {
            max_queue_size: 1,
            ..Default::default()
        });
        queue.publish_message("tasks", &message("a")).await.unwrap();
        assert!(queue.publish_message("tasks", &message("b")).await.is_err());
        queue.purge_queue("tasks").await.unwrap();
        assert!(queue.publish_message("tasks", &message("b")).await.is_ok());
    }
}
