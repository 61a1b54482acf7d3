use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use scheduler_core::{
    models::error_kinds,
    traits::{Delivery, ExecutionTracker, MessageQueue, TaskArgs},
    DeadLetterInfo, DeadLetterReason, ExecutionStatus, SchedulerResult, TaskError, TaskRegistry,
    TransitionMetadata,
};
use scheduler_infrastructure::{MetricsCollector, SchedulerContext, StructuredLogger};
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::middleware::ExecutionContext;
use crate::pipeline::{build_pipeline, Pipeline, PipelineDeps};

/// 单个投递处理所需的共享状态
struct WorkerShared {
    worker_id: String,
    broker: Arc<dyn MessageQueue>,
    registry: Arc<TaskRegistry>,
    tracker: Arc<dyn ExecutionTracker>,
    pipeline: Pipeline,
    store_args_snapshot: bool,
}

/// 工作池
///
/// 在一个进程内以 `concurrency` 个并发槽消费一个或多个队列。
/// 每个消费者的预取数量取 `min(prefetch_count, concurrency)`，
/// 未确认消息数量因此不会超过本进程能同时执行的任务数。
/// 多个进程消费同一队列时只依赖消息队列的投递模型协调。
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    queues: Vec<String>,
    concurrency: usize,
    prefetch_count: u16,
    drain_timeout: Duration,
}

impl WorkerPool {
    pub fn from_context(context: &SchedulerContext) -> Self {
        let config = context.config();
        let pipeline = build_pipeline(&PipelineDeps::from_context(context));
        Self {
            shared: Arc::new(WorkerShared {
                worker_id: config.worker.worker_id.clone(),
                broker: context.broker(),
                registry: context.registry(),
                tracker: context.tracker(),
                pipeline,
                store_args_snapshot: config.tracker.store_args_snapshot,
            }),
            queues: config.worker_queues(),
            concurrency: config.worker.concurrency.max(1),
            prefetch_count: config.broker.prefetch_count,
            drain_timeout: config.worker.drain_timeout(),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.worker_id = worker_id.into();
        }
        self
    }

    /// 替换默认流水线, 例如接入不同的结果后端
    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.pipeline = pipeline;
        }
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.worker_id
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.shared.pipeline
    }

    /// 单个消费者的预取数量
    pub fn effective_prefetch(&self) -> u16 {
        let concurrency = u16::try_from(self.concurrency).unwrap_or(u16::MAX);
        self.prefetch_count.min(concurrency).max(1)
    }

    /// 消费循环, 收到关闭信号后排空在途任务
    ///
    /// 关闭时先停止接收新投递, 在 `drain_timeout` 内等待在途任务完成,
    /// 超时仍未完成的任务其投递被 nack 回原队列, 交由其他工作进程重新执行。
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        let prefetch = self.effective_prefetch();
        let mut consumers = Vec::with_capacity(self.queues.len());
        for queue in &self.queues {
            consumers.push(self.shared.broker.consume(queue, prefetch).await?);
        }
        let mut deliveries = stream::select_all(consumers);

        info!(
            worker_id = %self.shared.worker_id,
            queues = ?self.queues,
            concurrency = self.concurrency,
            prefetch,
            "工作池启动"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let in_flight: Arc<Mutex<HashMap<u64, Delivery>>> = Arc::new(Mutex::new(HashMap::new()));
        let sequence = AtomicU64::new(0);
        let mut tasks = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown_rx.recv() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                _ = shutdown_rx.recv() => break,
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        warn!("接收投递失败: {}", e);
                        continue;
                    }
                    None => {
                        info!("投递流已结束");
                        break;
                    }
                },
            };

            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    error!("任务执行协程异常退出: {}", e);
                }
            }

            let id = sequence.fetch_add(1, Ordering::Relaxed);
            in_flight.lock().await.insert(id, delivery.clone());
            self.report_in_flight(&semaphore);

            let shared = self.shared.clone();
            let in_flight = in_flight.clone();
            let semaphore = semaphore.clone();
            let concurrency = self.concurrency;
            tasks.spawn(async move {
                process_delivery(&shared, delivery).await;
                in_flight.lock().await.remove(&id);
                drop(permit);
                MetricsCollector::set_in_flight(
                    &shared.worker_id,
                    concurrency - semaphore.available_permits(),
                );
            });
        }

        // 停止接收新投递
        drop(deliveries);
        info!(
            worker_id = %self.shared.worker_id,
            in_flight = tasks.len(),
            drain_timeout_seconds = self.drain_timeout.as_secs_f64(),
            "工作池停止接收新任务, 等待在途任务完成"
        );

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while let Some(finished) = tasks.join_next().await {
                if let Err(e) = finished {
                    error!("任务执行协程异常退出: {}", e);
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            let remaining: Vec<Delivery> = in_flight.lock().await.drain().map(|(_, d)| d).collect();
            warn!(count = remaining.len(), "排空超时, 在途任务重新入队");
            for delivery in remaining {
                if let Err(e) = delivery.nack(true).await {
                    error!(task_id = %delivery.message.task_id, "强制重新入队失败: {}", e);
                }
            }
            tasks.shutdown().await;
        }

        MetricsCollector::set_in_flight(&self.shared.worker_id, 0);
        info!(worker_id = %self.shared.worker_id, drained, "工作池已停止");
        Ok(())
    }

    fn report_in_flight(&self, semaphore: &Semaphore) {
        MetricsCollector::set_in_flight(
            &self.shared.worker_id,
            self.concurrency - semaphore.available_permits(),
        );
    }
}

async fn record(
    shared: &WorkerShared,
    message: &scheduler_core::TaskMessage,
    status: ExecutionStatus,
    metadata: TransitionMetadata,
) {
    if let Err(e) = shared
        .tracker
        .record_transition(&message.task_id, status, metadata)
        .await
    {
        warn!(task_id = %message.task_id, status = %status, "写入执行记录失败: {}", e);
    }
}

/// 处理一次投递: 记录 pending, 执行流水线, 依据结果确认或重新入队
async fn process_delivery(shared: &WorkerShared, delivery: Delivery) {
    let message = delivery.message.clone();
    debug!(task_id = %message.task_id, task_name = %message.task_name, attempt = message.attempt(), "收到任务");

    let mut pending = TransitionMetadata::new(&message.task_name, message.attempt());
    if shared.store_args_snapshot {
        pending = pending.with_args_snapshot(TaskArgs::from_message(&message).snapshot());
    }
    record(shared, &message, ExecutionStatus::Pending, pending).await;

    let Some(task) = shared.registry.get(&message.task_name).await else {
        dead_letter_unknown(shared, &delivery).await;
        return;
    };

    let mut ctx = ExecutionContext::new(
        delivery.queue.clone(),
        message,
        task,
        shared.worker_id.clone(),
    );
    let outcome = shared.pipeline.execute(&mut ctx).await;

    let settled = if outcome.is_settled() {
        delivery.ack().await
    } else {
        warn!(
            task_id = %ctx.task_id(),
            error = ?outcome.error(),
            "任务结果未能处置, 重新入队"
        );
        delivery.nack(true).await
    };
    if let Err(e) = settled {
        error!(task_id = %ctx.task_id(), "确认消息失败: {}", e);
    }
}

/// 未注册的任务名按永久错误处理, 直接进入死信队列
async fn dead_letter_unknown(shared: &WorkerShared, delivery: &Delivery) {
    let message = &delivery.message;
    let error = TaskError::new(
        error_kinds::UNKNOWN_TASK,
        format!("任务未注册: {}", message.task_name),
    );
    let now = Utc::now();
    let info = DeadLetterInfo {
        reason: DeadLetterReason::UnknownTask,
        attempt_count: message.attempt(),
        elapsed_ms: message.elapsed_ms(now),
        last_error: Some(error.clone()),
        dead_lettered_at: now,
    };

    if let Err(e) = shared
        .broker
        .publish_dead_letter(&delivery.queue, &message.dead_lettered(info.clone()))
        .await
    {
        error!(task_id = %message.task_id, "发布死信消息失败, 交由消息队列处理: {}", e);
        if let Err(e) = delivery.nack(false).await {
            error!(task_id = %message.task_id, "拒绝消息失败: {}", e);
        }
        return;
    }

    MetricsCollector::record_dead_lettered(&message.task_name, info.reason.as_str());
    StructuredLogger::log_task_dead_lettered(message, &info);
    record(
        shared,
        message,
        ExecutionStatus::DeadLettered,
        TransitionMetadata::new(&message.task_name, message.attempt()).with_error(error),
    )
    .await;

    if let Err(e) = delivery.ack().await {
        error!(task_id = %message.task_id, "确认消息失败: {}", e);
    }
}
