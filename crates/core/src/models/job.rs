use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 作业触发器
///
/// 决定作业何时触发。`Cron` 同时接受5字段 crontab 与带秒的6/7字段表达式。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Cron {
        expression: String,
    },
    Interval {
        seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_at: Option<DateTime<Utc>>,
    },
    Date {
        run_at: DateTime<Utc>,
    },
}

impl Trigger {
    pub fn cron(expression: impl Into<String>) -> Self {
        Trigger::Cron {
            expression: expression.into(),
        }
    }

    pub fn interval(seconds: u64) -> Self {
        Trigger::Interval {
            seconds,
            start_at: None,
        }
    }

    pub fn date(run_at: DateTime<Utc>) -> Self {
        Trigger::Date { run_at }
    }

    /// 用于日志输出的简短描述
    pub fn describe(&self) -> String {
        match self {
            Trigger::Cron { expression } => format!("cron[{expression}]"),
            Trigger::Interval { seconds, .. } => format!("interval[{seconds}s]"),
            Trigger::Date { run_at } => format!("date[{}]", run_at.to_rfc3339()),
        }
    }

    /// 一次性触发器在触发后不再有下一次
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Trigger::Date { .. })
    }
}

/// 调度作业定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub trigger: Trigger,
    pub task_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub next_run_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paused: bool,
    /// 未设置时使用调度器的默认宽限期
    #[serde(default)]
    pub misfire_grace_seconds: Option<u64>,
    #[serde(default = "default_coalesce")]
    pub coalesce: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
}

fn default_coalesce() -> bool {
    true
}

impl Job {
    pub fn new(id: impl Into<String>, trigger: Trigger, task_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            trigger,
            task_name: task_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            next_run_time: None,
            paused: false,
            misfire_grace_seconds: None,
            coalesce: default_coalesce(),
            last_fired_at: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_misfire_grace_seconds(mut self, seconds: u64) -> Self {
        self.misfire_grace_seconds = Some(seconds);
        self
    }

    pub fn with_coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }

    /// 作业未暂停且存在下一次触发时间
    pub fn is_active(&self) -> bool {
        !self.paused && self.next_run_time.is_some()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.paused && self.next_run_time.is_some_and(|t| t <= now)
    }
}
