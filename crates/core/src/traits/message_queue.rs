//! 消息队列抽象接口
//!
//! 提供至少一次投递语义的持久化传输：
//! - `publish_message` 返回成功前消息必须已持久化
//! - `consume` 返回带显式 ack/nack 控制的投递流，`prefetch_count` 限制单个消费者
//!   持有的未确认消息数量，这是系统唯一的背压机制
//! - `nack(requeue = false)` 把消息路由到死信队列

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{models::TaskMessage, SchedulerResult};

/// 投递流
pub type DeliveryStream = BoxStream<'static, SchedulerResult<Delivery>>;

/// 单条投递的确认句柄，由具体的队列实现提供
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// 确认消息处理完成，消息从队列中永久移除
    async fn ack(&self) -> SchedulerResult<()>;

    /// 拒绝消息：`requeue = true` 重新投递，否则进入死信队列
    async fn nack(&self, requeue: bool) -> SchedulerResult<()>;
}

/// 一次消息投递
///
/// 可被克隆以便工作池在强制关闭时找回未完成的投递；确认句柄只能被消费一次，
/// 后续的 ack/nack 调用返回 `Ok(false)`。
#[derive(Clone)]
pub struct Delivery {
    pub queue: String,
    pub message: TaskMessage,
    acker: Arc<Mutex<Option<Box<dyn Acknowledger>>>>,
}

impl Delivery {
    pub fn new(queue: impl Into<String>, message: TaskMessage, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            queue: queue.into(),
            message,
            acker: Arc::new(Mutex::new(Some(acker))),
        }
    }

    fn take_acker(&self) -> Option<Box<dyn Acknowledger>> {
        match self.acker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    pub async fn ack(&self) -> SchedulerResult<bool> {
        match self.take_acker() {
            Some(acker) => acker.ack().await.map(|_| true),
            None => Ok(false),
        }
    }

    pub async fn nack(&self, requeue: bool) -> SchedulerResult<bool> {
        match self.take_acker() {
            Some(acker) => acker.nack(requeue).await.map(|_| true),
            None => Ok(false),
        }
    }

    pub fn is_settled(&self) -> bool {
        match self.acker.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("task_id", &self.message.task_id)
            .field("task_name", &self.message.task_name)
            .field("attempt", &self.message.attempt())
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// 消息队列抽象接口
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// 发布消息到指定队列, 返回时消息已持久化
    async fn publish_message(&self, queue: &str, message: &TaskMessage) -> SchedulerResult<()>;

    /// 延迟发布, 在 `delay` 之后消息才对消费者可见
    async fn publish_delayed(
        &self,
        queue: &str,
        message: &TaskMessage,
        delay: Duration,
    ) -> SchedulerResult<()>;

    /// 发布到指定队列对应的死信队列
    async fn publish_dead_letter(&self, queue: &str, message: &TaskMessage) -> SchedulerResult<()>;

    /// 消费指定队列
    async fn consume(&self, queue: &str, prefetch_count: u16) -> SchedulerResult<DeliveryStream>;

    /// 声明队列及其死信队列与延迟队列
    async fn create_queue(&self, queue: &str, durable: bool) -> SchedulerResult<()>;

    /// 获取队列中待投递的消息数量
    async fn get_queue_size(&self, queue: &str) -> SchedulerResult<u32>;

    /// 清空队列
    async fn purge_queue(&self, queue: &str) -> SchedulerResult<()>;

    /// 死信队列名称
    fn dead_letter_queue(&self, queue: &str) -> String;

    /// 连接健康状态
    async fn is_healthy(&self) -> bool;

    /// 关闭连接
    async fn close(&self) -> SchedulerResult<()>;
}
