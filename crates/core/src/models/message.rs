use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::TaskError;

/// 发布到消息队列的任务消息
///
/// 消息一经创建即不可变；重试时通过 [`TaskMessage::next_attempt`] 派生新的副本，
/// `task_id` 在整个重试链路中保持不变。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: String,
    pub task_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub headers: MessageHeaders,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeaders {
    /// 首次入队时间, 重试截止时间以此为起点
    pub enqueued_at: DateTime<Utc>,
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub trace_context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<DeadLetterInfo>,
}

fn first_attempt() -> u32 {
    1
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self {
            enqueued_at: Utc::now(),
            attempt: first_attempt(),
            idempotency_key: None,
            trace_context: HashMap::new(),
            scheduled_job_id: None,
            dead_letter: None,
        }
    }
}

impl Default for MessageHeaders {
    fn default() -> Self {
        Self::new()
    }
}

/// 进入死信队列的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    NonRetryable,
    RetriesExhausted,
    DeadlineExceeded,
    UnknownTask,
    Undecodable,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::NonRetryable => "non_retryable",
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
            DeadLetterReason::DeadlineExceeded => "deadline_exceeded",
            DeadLetterReason::UnknownTask => "unknown_task",
            DeadLetterReason::Undecodable => "undecodable",
        }
    }
}

/// 死信消息携带的重试统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterInfo {
    pub reason: DeadLetterReason,
    pub attempt_count: u32,
    pub elapsed_ms: i64,
    pub last_error: Option<TaskError>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(task_name: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            task_name: task_name.into(),
            args,
            kwargs,
            headers: MessageHeaders::new(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.headers.idempotency_key = Some(key.into());
        self
    }

    pub fn with_scheduled_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.headers.scheduled_job_id = Some(job_id.into());
        self
    }

    pub fn with_trace_context(mut self, trace_context: HashMap<String, String>) -> Self {
        self.headers.trace_context = trace_context;
        self
    }

    pub fn attempt(&self) -> u32 {
        self.headers.attempt
    }

    /// 派生下一次尝试的消息副本
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.headers.attempt = self.headers.attempt.saturating_add(1);
        next
    }

    /// 派生附带死信统计的消息副本
    pub fn dead_lettered(&self, info: DeadLetterInfo) -> Self {
        let mut dead = self.clone();
        dead.headers.dead_letter = Some(info);
        dead
    }

    /// 自首次入队以来经过的毫秒数
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.headers.enqueued_at).num_milliseconds().max(0)
    }

    pub fn serialize_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn deserialize_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// 死信队列命名规则
pub fn dead_letter_queue_name(queue: &str, suffix: &str) -> String {
    format!("{queue}{suffix}")
}
