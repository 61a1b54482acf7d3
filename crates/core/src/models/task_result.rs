use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 常用错误类型名
pub mod error_kinds {
    pub const TRANSIENT: &str = "Transient";
    pub const PERMANENT: &str = "Permanent";
    pub const TIMEOUT: &str = "Timeout";
    pub const CONNECTION: &str = "ConnectionError";
    pub const NETWORK: &str = "NetworkError";
    pub const VALIDATION: &str = "ValidationError";
    pub const UNKNOWN_TASK: &str = "UnknownTask";
    pub const UNDECODABLE: &str = "Undecodable";
    pub const RESULT_BACKEND: &str = "ResultBackendError";
    pub const INFRASTRUCTURE: &str = "InfrastructureError";
}

/// 任务处理函数返回的结构化错误
///
/// `kind` 是错误分类名，重试中间件依据它判断是否可重试。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl TaskError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(error_kinds::TRANSIENT, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(error_kinds::PERMANENT, message)
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            error_kinds::TIMEOUT,
            format!("任务执行超过 {} 秒", limit.as_secs_f64()),
        )
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// 结果后端保存的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub task_name: String,
    pub is_err: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(task_id: impl Into<String>, task_name: impl Into<String>, value: Value) -> Self {
        Self {
            task_id: task_id.into(),
            task_name: task_name.into(),
            is_err: false,
            return_value: Some(value),
            error: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(
        task_id: impl Into<String>,
        task_name: impl Into<String>,
        error: TaskError,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_name: task_name.into(),
            is_err: true,
            return_value: None,
            error: Some(error),
            completed_at: Utc::now(),
        }
    }

    pub fn into_result(self) -> Result<Value, TaskError> {
        match (self.is_err, self.error) {
            (true, Some(error)) => Err(error),
            (true, None) => Err(TaskError::new(error_kinds::INFRASTRUCTURE, "缺少错误详情")),
            (false, _) => Ok(self.return_value.unwrap_or(Value::Null)),
        }
    }
}
