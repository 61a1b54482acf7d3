pub mod manager;
pub mod sqlite;

pub use manager::DatabaseManager;
pub use sqlite::{SqliteExecutionTracker, SqliteJobStore, SqliteResultBackend};

use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};

/// 时间列统一存储为 UTC 毫秒
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> SchedulerResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| SchedulerError::Internal(format!("无效的时间戳: {millis}")))
}

pub(crate) fn from_optional_millis(millis: Option<i64>) -> SchedulerResult<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}
