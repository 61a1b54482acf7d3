use std::sync::Arc;

use scheduler_core::{
    config::{BrokerConfig, BrokerType, ConfigValidator, ResultBackendConfig, ResultBackendType},
    traits::{MessageQueue, ResultBackend},
    SchedulerError, SchedulerResult,
};
use tracing::{debug, info};

use crate::{
    database::{DatabaseManager, SqliteResultBackend},
    in_memory_queue::{InMemoryMessageQueue, InMemoryQueueConfig},
    RabbitMQMessageQueue, RedisResultBackend,
};

pub struct MessageQueueFactory;

impl MessageQueueFactory {
    pub async fn create(config: &BrokerConfig) -> SchedulerResult<Arc<dyn MessageQueue>> {
        config.validate()?;
        debug!("Creating message queue with type: {:?}", config.r#type);

        match config.r#type {
            BrokerType::Rabbitmq => {
                info!("Initializing RabbitMQ message queue");
                let rabbitmq = RabbitMQMessageQueue::new(config.clone()).await?;
                Ok(Arc::new(rabbitmq))
            }
            BrokerType::InMemory => {
                info!("Initializing in-process message queue");
                let queue = InMemoryMessageQueue::with_config(InMemoryQueueConfig {
                    dead_letter_suffix: config.dead_letter_suffix.clone(),
                    ..Default::default()
                });
                Ok(Arc::new(queue))
            }
        }
    }

    pub fn get_type_string(queue_type: &BrokerType) -> &'static str {
        match queue_type {
            BrokerType::Rabbitmq => "rabbitmq",
            BrokerType::InMemory => "in_memory",
        }
    }

    pub fn parse_type_string(type_str: &str) -> SchedulerResult<BrokerType> {
        match type_str.to_lowercase().as_str() {
            "rabbitmq" => Ok(BrokerType::Rabbitmq),
            "in_memory" | "memory" => Ok(BrokerType::InMemory),
            _ => Err(SchedulerError::Configuration(format!(
                "不支持的消息队列类型: {type_str}，支持的类型: rabbitmq, in_memory"
            ))),
        }
    }
}

/// 结果后端策略, 部署时二选一
pub struct ResultBackendFactory;

impl ResultBackendFactory {
    pub async fn create(
        config: &ResultBackendConfig,
        database: &DatabaseManager,
    ) -> SchedulerResult<Arc<dyn ResultBackend>> {
        config.validate()?;

        match config.r#type {
            ResultBackendType::Redis => {
                info!("Initializing Redis result backend");
                Ok(Arc::new(RedisResultBackend::new(config).await?))
            }
            ResultBackendType::Database => {
                info!("Initializing database result backend");
                Ok(Arc::new(SqliteResultBackend::new(
                    database.pool().clone(),
                    config.poll_interval(),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_type_string() {
        assert_eq!(
            MessageQueueFactory::parse_type_string("rabbitmq").unwrap(),
            BrokerType::Rabbitmq
        );
        assert_eq!(
            MessageQueueFactory::parse_type_string("IN_MEMORY").unwrap(),
            BrokerType::InMemory
        );
        assert!(MessageQueueFactory::parse_type_string("redis_stream").is_err());
    }

    #[test]
    fn test_get_type_string() {
        assert_eq!(
            MessageQueueFactory::get_type_string(&BrokerType::Rabbitmq),
            "rabbitmq"
        );
        assert_eq!(
            MessageQueueFactory::get_type_string(&BrokerType::InMemory),
            "in_memory"
        );
    }

    #[tokio::test]
    async fn test_create_in_memory_queue() {
        let config = BrokerConfig {
            dead_letter_suffix: ".failed".to_string(),
            ..Default::default()
        };
        let queue = MessageQueueFactory::create(&config).await.unwrap();
        assert!(queue.is_healthy().await);
        assert_eq!(queue.dead_letter_queue("tasks"), "tasks.failed");
    }

    #[tokio::test]
    async fn test_invalid_rabbitmq_url_is_rejected() {
        let config = BrokerConfig {
            r#type: BrokerType::Rabbitmq,
            url: "invalid://localhost:5672".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            MessageQueueFactory::create(&config).await,
            Err(SchedulerError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_create_database_result_backend() {
        let database = DatabaseManager::in_memory().await.unwrap();
        let backend = ResultBackendFactory::create(&ResultBackendConfig::default(), &database)
            .await
            .unwrap();
        assert_eq!(backend.backend_name(), "database");
        assert!(backend.is_healthy().await);
    }
}
