use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{
    config::RetryConfig,
    retry::{RetryClassifier, RetryPolicy},
    traits::TaskHandler,
    SchedulerError, SchedulerResult,
};

/// 任务的执行元数据
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub classifier: RetryClassifier,
    /// 结果保留时长, 未设置时使用结果后端的默认值
    pub result_ttl: Option<Duration>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for TaskOptions {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            timeout: Duration::from_secs(config.timeout_seconds),
            retry_policy: config.policy(),
            classifier: RetryClassifier::new(),
            result_ttl: None,
        }
    }
}

impl TaskOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout = Duration::from_secs(seconds);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// 可重试的错误类型
    pub fn retry_on<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.classifier = self.classifier.retry_on(kinds);
        self
    }

    /// 永不重试的错误类型
    pub fn never_retry<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.classifier = self.classifier.never_retry(kinds);
        self
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = Some(ttl);
        self
    }
}

/// 已注册的任务
pub struct RegisteredTask {
    pub name: String,
    pub handler: Arc<dyn TaskHandler>,
    pub options: TaskOptions,
}

/// 任务注册表：任务名 → 处理函数 + 元数据
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<String, Arc<RegisteredTask>>>>,
    defaults: TaskOptions,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::with_defaults(TaskOptions::default())
    }

    pub fn with_defaults(defaults: TaskOptions) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            defaults,
        }
    }

    /// 默认任务选项, 未显式指定时使用
    pub fn defaults(&self) -> TaskOptions {
        self.defaults.clone()
    }

    /// 注册任务, 任务名重复时返回错误
    pub async fn register_task<H>(
        &self,
        name: impl Into<String>,
        handler: H,
        options: TaskOptions,
    ) -> SchedulerResult<()>
    where
        H: TaskHandler + 'static,
    {
        let name = name.into();
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&name) {
            return Err(SchedulerError::DuplicateTask { name });
        }

        info!(
            task_name = %name,
            max_attempts = options.max_attempts,
            timeout_seconds = options.timeout.as_secs_f64(),
            "注册任务"
        );
        tasks.insert(
            name.clone(),
            Arc::new(RegisteredTask {
                name,
                handler: Arc::new(handler),
                options,
            }),
        );
        Ok(())
    }

    /// 使用默认选项注册任务
    pub async fn register<H>(&self, name: impl Into<String>, handler: H) -> SchedulerResult<()>
    where
        H: TaskHandler + 'static,
    {
        self.register_task(name, handler, self.defaults()).await
    }

    pub async fn get(&self, name: &str) -> Option<Arc<RegisteredTask>> {
        let tasks = self.tasks.read().await;
        tasks.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.tasks.read().await.contains_key(name)
    }

    pub async fn task_names(&self) -> Vec<String> {
        let tasks = self.tasks.read().await;
        let mut names: Vec<String> = tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.tasks.write().await.remove(name).is_some();
        if removed {
            debug!(task_name = %name, "注销任务");
        }
        removed
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
