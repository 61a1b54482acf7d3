use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::*,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use scheduler_core::{
    config::BrokerConfig,
    models::{dead_letter_queue_name, TaskMessage},
    traits::{Acknowledger, Delivery, DeliveryStream, MessageQueue},
    SchedulerError, SchedulerResult,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 延迟分桶粒度
const DELAY_BUCKET_MS: u64 = 100;
/// 延迟队列在最后一条消息到期后继续保留的时间
const DELAY_QUEUE_IDLE_MS: u64 = 60_000;

/// 把延迟时长归入分桶: 不足一个粒度的保持原值, 其余四舍五入到粒度的整数倍
fn delay_bucket_ms(delay: Duration) -> u64 {
    let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if ms < DELAY_BUCKET_MS {
        return ms.max(1);
    }
    ms.saturating_add(DELAY_BUCKET_MS / 2) / DELAY_BUCKET_MS * DELAY_BUCKET_MS
}

/// 延迟队列参数: 固定 TTL, 到期后经默认交换机回到工作队列
fn delay_queue_arguments(work_queue: &str, bucket_ms: u64) -> FieldTable {
    let mut args = dead_letter_to(work_queue);
    args.insert(
        ShortString::from("x-message-ttl"),
        AMQPValue::LongLongInt(i64::try_from(bucket_ms).unwrap_or(i64::MAX)),
    );
    args.insert(
        ShortString::from("x-expires"),
        AMQPValue::LongLongInt(
            i64::try_from(bucket_ms.saturating_add(DELAY_QUEUE_IDLE_MS)).unwrap_or(i64::MAX),
        ),
    );
    args
}

fn mq_error(context: &str, e: impl std::fmt::Display) -> SchedulerError {
    SchedulerError::MessageQueue(format!("{context}: {e}"))
}

/// RabbitMQ消息队列实现
///
/// 每个工作队列配套两个队列：
/// - `{queue}{dead_letter_suffix}` 死信队列，工作队列以它作为 DLX 路由目标
/// - `{queue}{delay_suffix}.{bucket_ms}` 延迟队列，按延迟时长分桶，
///   每个桶使用固定的 `x-message-ttl`，到期后回流到工作队列
///
/// 同一延迟队列内的消息过期时间相同，因此按 FIFO 顺序到期，不会出现队首阻塞。
/// 空闲的延迟队列由 `x-expires` 自动删除。
///
/// 发布通道组成一个小型通道池并开启发布确认；每次消费使用独立通道，
/// 以便 `basic_qos` 的 prefetch 只作用于该消费者。
pub struct RabbitMQMessageQueue {
    connection: Connection,
    publish_channels: Vec<Channel>,
    next_channel: AtomicUsize,
    config: BrokerConfig,
    declared: Mutex<HashSet<String>>,
}

impl RabbitMQMessageQueue {
    /// 创建新的RabbitMQ消息队列实例
    pub async fn new(config: BrokerConfig) -> SchedulerResult<Self> {
        let connect = Connection::connect(&config.url, ConnectionProperties::default());
        let connection =
            tokio::time::timeout(Duration::from_secs(config.connection_timeout_seconds), connect)
                .await
                .map_err(|_| SchedulerError::MessageQueue("连接RabbitMQ超时".to_string()))?
                .map_err(|e| mq_error("连接RabbitMQ失败", e))?;

        let mut publish_channels = Vec::with_capacity(config.channel_pool_size.max(1));
        for _ in 0..config.channel_pool_size.max(1) {
            let channel = connection
                .create_channel()
                .await
                .map_err(|e| mq_error("创建通道失败", e))?;
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| mq_error("开启发布确认失败", e))?;
            publish_channels.push(channel);
        }

        info!(
            "成功连接到RabbitMQ, 发布通道数: {}",
            publish_channels.len()
        );

        let queue = Self {
            connection,
            publish_channels,
            next_channel: AtomicUsize::new(0),
            config,
            declared: Mutex::new(HashSet::new()),
        };
        let task_queue = queue.config.task_queue.clone();
        queue.create_queue(&task_queue, true).await?;
        Ok(queue)
    }

    fn channel(&self) -> &Channel {
        let index = self.next_channel.fetch_add(1, Ordering::Relaxed) % self.publish_channels.len();
        &self.publish_channels[index]
    }

    fn delay_queue(&self, queue: &str, bucket_ms: u64) -> String {
        format!("{queue}{}.{bucket_ms}", self.config.delay_suffix)
    }

    /// 管理操作使用的临时通道
    ///
    /// 被动声明不存在的队列时服务端会关闭所在通道, 不能占用发布通道池。
    async fn with_admin_channel<T, F, Fut>(&self, op: F) -> SchedulerResult<T>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: std::future::Future<Output = SchedulerResult<T>>,
    {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| mq_error("创建管理通道失败", e))?;
        let result = op(channel.clone()).await;
        if channel.status().connected() {
            if let Err(e) = channel.close(200, "管理操作完成").await {
                debug!("关闭管理通道失败: {}", e);
            }
        }
        result
    }

    async fn ensure_declared(&self, queue: &str) -> SchedulerResult<()> {
        if self.declared.lock().await.contains(queue) {
            return Ok(());
        }
        self.create_queue(queue, true).await
    }

    /// 声明队列
    async fn declare_queue(
        &self,
        channel: &Channel,
        queue_name: &str,
        durable: bool,
        arguments: FieldTable,
    ) -> SchedulerResult<()> {
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| mq_error(&format!("声明队列 {queue_name} 失败"), e))?;

        debug!("队列 {} 声明成功", queue_name);
        Ok(())
    }

    async fn publish_raw(
        &self,
        routing_key: &str,
        message: &TaskMessage,
        properties: BasicProperties,
    ) -> SchedulerResult<()> {
        let payload = message
            .serialize_bytes()
            .map_err(|e| SchedulerError::Serialization(format!("序列化消息失败: {e}")))?;

        let confirm = self
            .channel()
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties
                    .with_delivery_mode(2)
                    .with_message_id(ShortString::from(message.task_id.clone()))
                    .with_content_type(ShortString::from("application/json")),
            )
            .await
            .map_err(|e| mq_error(&format!("发布消息到队列 {routing_key} 失败"), e))?;

        let confirmation = confirm
            .await
            .map_err(|e| mq_error("消息发布确认失败", e))?;
        if confirmation.is_nack() {
            return Err(SchedulerError::MessageQueue(format!(
                "broker 拒绝了发布到 {routing_key} 的消息"
            )));
        }
        Ok(())
    }
}

fn dead_letter_to(routing_key: &str) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString("".into()),
    );
    args.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(routing_key.into()),
    );
    args
}

struct RabbitAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for RabbitAcker {
    async fn ack(&self) -> SchedulerResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| mq_error("确认消息失败", e))
    }

    async fn nack(&self, requeue: bool) -> SchedulerResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| mq_error("拒绝消息失败", e))
    }
}

#[async_trait]
impl MessageQueue for RabbitMQMessageQueue {
    async fn publish_message(&self, queue: &str, message: &TaskMessage) -> SchedulerResult<()> {
        self.ensure_declared(queue).await?;
        self.publish_raw(queue, message, BasicProperties::default())
            .await?;
        debug!(queue = %queue, task_id = %message.task_id, "消息已发布");
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
        self.ensure_declared(queue).await?;

        // 每次发布前重新声明, 以免空闲期间被 x-expires 删除后消息无处路由
        let bucket_ms = delay_bucket_ms(delay);
        let delay_queue = self.delay_queue(queue, bucket_ms);
        self.declare_queue(
            self.channel(),
            &delay_queue,
            true,
            delay_queue_arguments(queue, bucket_ms),
        )
        .await?;

        self.publish_raw(&delay_queue, message, BasicProperties::default())
            .await?;
        debug!(queue = %queue, task_id = %message.task_id, bucket_ms, "延迟消息已发布");
        Ok(())
    }

    async fn publish_dead_letter(&self, queue: &str, message: &TaskMessage) -> SchedulerResult<()> {
        self.ensure_declared(queue).await?;
        let dlq = self.dead_letter_queue(queue);
        self.publish_raw(&dlq, message, BasicProperties::default())
            .await
    }

    async fn consume(&self, queue: &str, prefetch_count: u16) -> SchedulerResult<DeliveryStream> {
        self.ensure_declared(queue).await?;

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| mq_error("创建消费通道失败", e))?;
        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| mq_error("设置prefetch失败", e))?;

        let consumer_tag = format!("{queue}-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| mq_error("创建消费者失败", e))?;

        info!(queue = %queue, consumer_tag = %consumer_tag, prefetch_count, "开始消费队列");

        let queue_name = queue.to_string();
        let deliveries = consumer.filter_map(move |item| {
            // 通道随消费流存活
            let _channel = channel.clone();
            let queue = queue_name.clone();
            async move {
                match item {
                    Ok(delivery) => match TaskMessage::deserialize_bytes(&delivery.data) {
                        Ok(message) => Some(Ok(Delivery::new(
                            queue,
                            message,
                            Box::new(RabbitAcker {
                                acker: delivery.acker,
                            }),
                        ))),
                        Err(e) => {
                            warn!(queue = %queue, error = %e, "无法解析的消息, 转入死信队列");
                            let nack = delivery
                                .acker
                                .nack(BasicNackOptions {
                                    requeue: false,
                                    ..Default::default()
                                })
                                .await;
                            if let Err(e) = nack {
                                warn!(queue = %queue, error = %e, "拒绝无法解析的消息失败");
                            }
                            None
                        }
                    },
                    Err(e) => Some(Err(mq_error("消费消息失败", e))),
                }
            }
        });

        Ok(Box::pin(deliveries))
    }

    /// 声明工作队列与死信队列, 延迟队列在发布时按需声明
    async fn create_queue(&self, queue: &str, durable: bool) -> SchedulerResult<()> {
        let channel = self.channel();
        let dlq = self.dead_letter_queue(queue);

        self.declare_queue(channel, &dlq, durable, FieldTable::default())
            .await?;
        self.declare_queue(channel, queue, durable, dead_letter_to(&dlq))
            .await?;

        self.declared.lock().await.insert(queue.to_string());
        Ok(())
    }

    /// 获取队列中的消息数量
    async fn get_queue_size(&self, queue: &str) -> SchedulerResult<u32> {
        self.with_admin_channel(|channel| async move {
            let queue_info = channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        passive: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await;

            match queue_info {
                Ok(info) => Ok(info.message_count()),
                Err(e) => {
                    let error_msg = e.to_string();
                    if error_msg.contains("NOT_FOUND") || error_msg.contains("404") {
                        debug!("队列 {} 不存在，返回大小为0", queue);
                        Ok(0)
                    } else {
                        Err(mq_error(&format!("获取队列 {queue} 信息失败"), e))
                    }
                }
            }
        })
        .await
    }

    /// 清空队列
    async fn purge_queue(&self, queue: &str) -> SchedulerResult<()> {
        self.with_admin_channel(|channel| async move {
            channel
                .queue_purge(queue, QueuePurgeOptions::default())
                .await
                .map_err(|e| mq_error(&format!("清空队列 {queue} 失败"), e))
        })
        .await?;

        debug!("队列 {} 已清空", queue);
        Ok(())
    }

    fn dead_letter_queue(&self, queue: &str) -> String {
        dead_letter_queue_name(queue, &self.config.dead_letter_suffix)
    }

    async fn is_healthy(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> SchedulerResult<()> {
        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| mq_error("关闭连接失败", e))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_bucket_rounds_to_granularity() {
        assert_eq!(delay_bucket_ms(Duration::ZERO), 1);
        assert_eq!(delay_bucket_ms(Duration::from_millis(40)), 40);
        assert_eq!(delay_bucket_ms(Duration::from_millis(1_049)), 1_000);
        assert_eq!(delay_bucket_ms(Duration::from_millis(1_050)), 1_100);
        assert_eq!(delay_bucket_ms(Duration::from_secs(60)), 60_000);
    }

    #[test]
    fn test_short_and_long_delays_use_separate_queues() {
        // 长延迟的消息不会挡住短延迟的消息
        assert_ne!(
            delay_bucket_ms(Duration::from_secs(60)),
            delay_bucket_ms(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_delay_queue_arguments() {
        let args = delay_queue_arguments("tasks", 1_000);
        let inner = args.inner();
        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongLongInt(1_000))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-expires")),
            Some(&AMQPValue::LongLongInt(61_000))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-dead-letter-routing-key")),
            Some(&AMQPValue::LongString("tasks".into()))
        );
    }
}
