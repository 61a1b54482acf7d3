use std::time::Duration;

use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("无效的触发器: {0}")]
    InvalidTrigger(String),

    #[error("作业已存在: {id}")]
    DuplicateJob { id: String },

    #[error("作业未找到: {id}")]
    JobNotFound { id: String },

    #[error("任务已注册: {name}")]
    DuplicateTask { name: String },

    #[error("任务未注册: {name}")]
    TaskNotFound { name: String },

    #[error("任务结果不存在: {task_id}")]
    ResultNotFound { task_id: String },

    /// wait_result 超时, 结果尚不可用
    #[error("等待任务结果超时: {task_id} ({timeout:?})")]
    ResultNotReady { task_id: String, timeout: Duration },

    #[error("结果后端错误: {0}")]
    ResultBackend(String),

    #[error("调度器租约错误: {0}")]
    Lease(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
