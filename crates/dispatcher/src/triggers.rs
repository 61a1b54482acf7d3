//! 触发器的触发时间计算
//!
//! 所有计算结果都严格晚于传入的当前时间, 错过的多次触发因此只会折叠成一次。

use chrono::{DateTime, Duration, Utc};
use scheduler_core::{models::Trigger, SchedulerError, SchedulerResult};

use crate::cron_utils::CronScheduler;

/// 间隔触发器允许的最大间隔 (约100年)
const MAX_INTERVAL_SECONDS: u64 = 100 * 365 * 24 * 3600;

pub trait FireTimes {
    fn validate(&self) -> SchedulerResult<()>;

    /// 作业添加、恢复或改期时的首次触发时间
    fn first_fire_time(&self, now: DateTime<Utc>) -> SchedulerResult<Option<DateTime<Utc>>>;

    /// 处理完计划于 `scheduled_at` 的触发之后, 严格晚于 `now` 的下一次触发时间
    fn next_fire_time(
        &self,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>>;
}

impl FireTimes for Trigger {
    fn validate(&self) -> SchedulerResult<()> {
        match self {
            Trigger::Cron { expression } => CronScheduler::validate_cron_expression(expression),
            Trigger::Interval { seconds, .. } => {
                if *seconds == 0 || *seconds > MAX_INTERVAL_SECONDS {
                    return Err(SchedulerError::InvalidTrigger(format!(
                        "间隔必须在 1-{MAX_INTERVAL_SECONDS} 秒之间, 实际为 {seconds}"
                    )));
                }
                Ok(())
            }
            Trigger::Date { .. } => Ok(()),
        }
    }

    fn first_fire_time(&self, now: DateTime<Utc>) -> SchedulerResult<Option<DateTime<Utc>>> {
        match self {
            Trigger::Cron { expression } => {
                Ok(CronScheduler::new(expression)?.next_execution_time(now))
            }
            Trigger::Interval {
                seconds,
                start_at: Some(anchor),
            } => next_on_grid(*anchor, *seconds, now).map(Some),
            Trigger::Interval {
                seconds,
                start_at: None,
            } => Ok(Some(now + interval(*seconds)?)),
            // 已过期的一次性作业仍然触发一次, 是否执行由错过触发规则决定
            Trigger::Date { run_at } => Ok(Some(*run_at)),
        }
    }

    fn next_fire_time(
        &self,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        match self {
            Trigger::Cron { expression } => {
                Ok(CronScheduler::new(expression)?.next_execution_time(now))
            }
            Trigger::Interval { seconds, start_at } => {
                next_on_grid(start_at.unwrap_or(scheduled_at), *seconds, now).map(Some)
            }
            Trigger::Date { .. } => Ok(None),
        }
    }
}

fn interval(seconds: u64) -> SchedulerResult<Duration> {
    i64::try_from(seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| SchedulerError::InvalidTrigger(format!("间隔过大: {seconds} 秒")))
}

/// `anchor + k * period` 中严格晚于 `now` 的最小值
fn next_on_grid(
    anchor: DateTime<Utc>,
    seconds: u64,
    now: DateTime<Utc>,
) -> SchedulerResult<DateTime<Utc>> {
    if anchor > now {
        return Ok(anchor);
    }

    let period_ms = interval(seconds)?.num_milliseconds();
    let steps = (now - anchor).num_milliseconds() / period_ms + 1;
    period_ms
        .checked_mul(steps)
        .and_then(Duration::try_milliseconds)
        .and_then(|offset| anchor.checked_add_signed(offset))
        .ok_or_else(|| SchedulerError::InvalidTrigger("下一次触发时间超出可表示范围".to_string()))
}
