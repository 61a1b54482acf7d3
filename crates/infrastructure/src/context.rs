use std::sync::Arc;

use scheduler_core::{
    config::{AppConfig, BrokerType, JobStoreType, ResultBackendType},
    traits::{ExecutionTracker, JobStore, MessageQueue, ResultBackend},
    SchedulerResult, TaskOptions, TaskRegistry,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    cleanup_service::ResultCleanupService,
    client::TaskClient,
    database::{DatabaseManager, SqliteExecutionTracker, SqliteJobStore},
    job_store::MemoryJobStore,
    message_queue_factory::{MessageQueueFactory, ResultBackendFactory},
};

/// 进程级上下文
///
/// 启动时构造一次，持有 broker 连接、任务注册表、执行追踪器、结果后端与作业存储，
/// 以引用方式传给调度器和工作池。关闭时必须显式调用 [`SchedulerContext::shutdown`]。
pub struct SchedulerContext {
    config: AppConfig,
    database: DatabaseManager,
    broker: Arc<dyn MessageQueue>,
    registry: Arc<TaskRegistry>,
    tracker: Arc<dyn ExecutionTracker>,
    results: Arc<dyn ResultBackend>,
    job_store: Arc<dyn JobStore>,
    result_sweeper: Mutex<Option<ResultCleanupService>>,
}

impl SchedulerContext {
    pub async fn from_config(config: AppConfig) -> SchedulerResult<Self> {
        let database = DatabaseManager::new(&config.database).await?;
        let broker = MessageQueueFactory::create(&config.broker).await?;
        Self::assemble(config, database, broker).await
    }

    /// 全部组件都在进程内: 内存队列 + 内存 SQLite
    pub async fn in_process(mut config: AppConfig) -> SchedulerResult<Self> {
        config.broker.r#type = BrokerType::InMemory;
        config.result_backend.r#type = ResultBackendType::Database;
        let database = DatabaseManager::in_memory().await?;
        let broker = MessageQueueFactory::create(&config.broker).await?;
        Self::assemble(config, database, broker).await
    }

    /// 使用外部构造的 broker, 其余组件按配置创建
    pub async fn with_broker(
        config: AppConfig,
        database: DatabaseManager,
        broker: Arc<dyn MessageQueue>,
    ) -> SchedulerResult<Self> {
        Self::assemble(config, database, broker).await
    }

    async fn assemble(
        config: AppConfig,
        database: DatabaseManager,
        broker: Arc<dyn MessageQueue>,
    ) -> SchedulerResult<Self> {
        broker.create_queue(&config.broker.task_queue, true).await?;

        let results = ResultBackendFactory::create(&config.result_backend, &database).await?;
        let tracker: Arc<dyn ExecutionTracker> =
            Arc::new(SqliteExecutionTracker::new(database.pool().clone()));
        let job_store: Arc<dyn JobStore> = match config.scheduler.job_store {
            JobStoreType::Memory => Arc::new(MemoryJobStore::new()),
            JobStoreType::Database => Arc::new(SqliteJobStore::new(database.pool().clone())),
        };
        let registry = Arc::new(TaskRegistry::with_defaults(TaskOptions::from(&config.retry)));

        info!(
            broker = MessageQueueFactory::get_type_string(&config.broker.r#type),
            result_backend = results.backend_name(),
            job_store = ?config.scheduler.job_store,
            "调度上下文初始化完成"
        );

        Ok(Self {
            config,
            database,
            broker,
            registry,
            tracker,
            results,
            job_store,
            result_sweeper: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.database
    }

    pub fn broker(&self) -> Arc<dyn MessageQueue> {
        self.broker.clone()
    }

    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.registry.clone()
    }

    pub fn tracker(&self) -> Arc<dyn ExecutionTracker> {
        self.tracker.clone()
    }

    pub fn results(&self) -> Arc<dyn ResultBackend> {
        self.results.clone()
    }

    pub fn job_store(&self) -> Arc<dyn JobStore> {
        self.job_store.clone()
    }

    pub fn task_queue(&self) -> &str {
        &self.config.broker.task_queue
    }

    pub fn client(&self) -> TaskClient {
        TaskClient::new(
            self.broker.clone(),
            self.results.clone(),
            self.tracker.clone(),
            self.config.broker.task_queue.clone(),
            self.config.broker.publish_timeout(),
        )
    }

    /// 启动后台服务; 只有关系型结果后端需要定期清理
    pub async fn start_background_services(&self) {
        if self.config.result_backend.r#type != ResultBackendType::Database {
            return;
        }
        let mut sweeper = self.result_sweeper.lock().await;
        if sweeper.is_none() {
            let mut service = ResultCleanupService::new(
                self.results.clone(),
                std::time::Duration::from_secs(self.config.result_backend.cleanup_interval_seconds),
            );
            service.start();
            *sweeper = Some(service);
        }
    }

    /// 释放所有连接, 调度器与工作池停止之后调用
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        info!("关闭调度上下文");

        if let Some(mut sweeper) = self.result_sweeper.lock().await.take() {
            sweeper.stop().await;
        }
        if let Err(e) = self.broker.close().await {
            warn!("关闭消息队列失败: {}", e);
        }
        self.database.close().await;

        info!("调度上下文已关闭");
        Ok(())
    }
}
