//! 任务调度子系统的基础设施适配器：消息队列、结果后端、执行追踪器、作业存储、
//! 可观测性与进程级上下文。

pub mod cleanup_service;
pub mod client;
pub mod context;
pub mod database;
pub mod in_memory_queue;
pub mod job_store;
pub mod message_queue;
pub mod message_queue_factory;
pub mod observability;
pub mod redis_result_backend;

pub use cleanup_service::ResultCleanupService;
pub use client::{TaskClient, TaskHandle};
pub use context::SchedulerContext;
pub use database::{DatabaseManager, SqliteExecutionTracker, SqliteJobStore, SqliteResultBackend};
pub use in_memory_queue::{InMemoryMessageQueue, InMemoryQueueConfig};
pub use job_store::MemoryJobStore;
pub use message_queue::RabbitMQMessageQueue;
pub use message_queue_factory::{MessageQueueFactory, ResultBackendFactory};
pub use redis_result_backend::RedisResultBackend;
pub use observability::{
    init_metrics, init_observability, CrossComponentTracer, MetricsCollector, ObservabilityGuard,
    StructuredLogger, TaskTracer,
};
