use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::debug;

use scheduler_core::{SchedulerError, SchedulerResult};

/// crontab 星期编号 0-7 对应的名称, 0 与 7 都是星期日
const WEEKDAY_NAMES: [&str; 8] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

fn invalid_cron(expr: &str, message: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidCron {
        expr: expr.to_string(),
        message: message.into(),
    }
}

/// CRON表达式解析和调度工具
///
/// 接受标准的5字段 crontab (`分 时 日 月 周`) 以及带秒的6/7字段表达式。
/// 5字段表达式在解析前补齐秒字段, 星期字段的数字按 crontab 约定 (0=周日) 换算成名称。
pub struct CronScheduler {
    expression: String,
    schedule: Schedule,
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> SchedulerResult<Self> {
        let normalized = normalize_expression(cron_expr)?;
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| invalid_cron(cron_expr, e.to_string()))?;

        if normalized != cron_expr.trim() {
            debug!(expression = cron_expr, normalized = %normalized, "CRON表达式已规范化");
        }

        Ok(Self {
            expression: cron_expr.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// 获取严格晚于 `from` 的下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }

    /// 计算下次执行时间距离现在的时长
    pub fn time_until_next_execution(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_execution_time(now).map(|next| next - now)
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> SchedulerResult<()> {
        Self::new(cron_expr).map(|_| ())
    }
}

/// 把表达式规范化为 `cron` crate 接受的带秒格式
pub fn normalize_expression(cron_expr: &str) -> SchedulerResult<String> {
    let trimmed = cron_expr.trim();
    if trimmed.starts_with('@') {
        return Ok(trimmed.to_string());
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    match fields.len() {
        5 => {
            let weekday = translate_weekday_field(fields[4])
                .map_err(|message| invalid_cron(cron_expr, message))?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], weekday
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(invalid_cron(
            cron_expr,
            format!("需要5、6或7个字段, 实际为{n}个"),
        )),
    }
}

fn translate_weekday_field(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let items = field
        .split(',')
        .map(translate_weekday_item)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items.join(","))
}

/// 单个星期项: `*`、`n`、`a-b`, 可带 `/step`; 含名称的项原样保留
fn translate_weekday_item(item: &str) -> Result<String, String> {
    if item.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(item.to_string());
    }

    let (range, step) = match item.split_once('/') {
        Some((range, step)) => {
            let step: u8 = step
                .parse()
                .map_err(|_| format!("无效的星期步长: {item}"))?;
            if step == 0 {
                return Err(format!("星期步长不能为0: {item}"));
            }
            (range, step)
        }
        None => (item, 1),
    };

    let (start, end) = match range.split_once('-') {
        Some((start, end)) => (parse_weekday(start)?, parse_weekday(end)?),
        None if range == "*" => (0, 6),
        // `n/step` 表示从 n 开始到周末
        None if step > 1 => (parse_weekday(range)?, 6),
        None => {
            let day = parse_weekday(range)?;
            (day, day)
        }
    };
    if start > end {
        return Err(format!("无效的星期范围: {item}"));
    }

    let days: BTreeSet<u8> = (start..=end).step_by(step as usize).map(|d| d % 7).collect();
    Ok(days
        .into_iter()
        .map(|d| WEEKDAY_NAMES[d as usize])
        .collect::<Vec<_>>()
        .join(","))
}

fn parse_weekday(token: &str) -> Result<u8, String> {
    match token.parse::<u8>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("无效的星期值: {token}")),
    }
}
