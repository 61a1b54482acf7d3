use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn, Instrument};

use scheduler_core::{
    config::SchedulerConfig,
    models::{Job, TaskMessage, Trigger},
    traits::JobStore,
    SchedulerError, SchedulerResult,
};
use scheduler_infrastructure::{
    MetricsCollector, SchedulerContext, StructuredLogger, TaskClient, TaskTracer,
};

use crate::triggers::FireTimes;

/// 一次成功的触发
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredJob {
    pub job_id: String,
    pub task_id: String,
}

/// 单次检查的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fired: Vec<FiredJob>,
    /// 超过宽限期且合并错过触发而跳过的作业
    pub skipped: Vec<String>,
    /// 发布失败的作业, 本次触发不会重试
    pub failed: Vec<String>,
}

/// 定时调度器
///
/// 独占作业存储。到期作业触发时只向消息队列发布一条任务消息，
/// 从不直接调用处理函数。多实例部署时通过作业存储的租约保证同一时刻只有一个实例评估触发器。
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    client: TaskClient,
    queue: String,
    config: SchedulerConfig,
    // 串行化控制接口与触发评估, 改期不会与一次检查交错
    evaluation: Mutex<()>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, client: TaskClient, config: SchedulerConfig) -> Self {
        let client = client.with_publish_timeout(config.publish_timeout());
        let queue = client.default_queue().to_string();
        Self {
            store,
            client,
            queue,
            config,
            evaluation: Mutex::new(()),
        }
    }

    pub fn from_context(context: &SchedulerContext) -> Self {
        Self::new(
            context.job_store(),
            context.client(),
            context.config().scheduler.clone(),
        )
    }

    /// 触发的任务发布到指定队列, 默认为客户端的默认队列
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub async fn add_job(&self, mut job: Job) -> SchedulerResult<Job> {
        if job.id.trim().is_empty() || job.task_name.trim().is_empty() {
            return Err(SchedulerError::InvalidTrigger(
                "作业ID与任务名不能为空".to_string(),
            ));
        }
        job.trigger.validate()?;
        self.reject_expired_date(&job, &job.trigger, Utc::now())?;

        let _guard = self.evaluation.lock().await;
        job.next_run_time = if job.paused {
            None
        } else {
            job.trigger.first_fire_time(Utc::now())?
        };
        self.store.add_job(&job).await?;

        info!(
            job_id = %job.id,
            task_name = %job.task_name,
            trigger = %job.trigger.describe(),
            next_run_time = ?job.next_run_time,
            "添加调度作业"
        );
        Ok(job)
    }

    pub async fn pause_job(&self, id: &str) -> SchedulerResult<Job> {
        let _guard = self.evaluation.lock().await;
        let mut job = self.load(id).await?;
        job.paused = true;
        job.next_run_time = None;
        self.store.update_job(&job).await?;

        info!(job_id = %id, "暂停调度作业");
        Ok(job)
    }

    /// 恢复作业, 按当前时间重新计算下一次触发
    pub async fn resume_job(&self, id: &str) -> SchedulerResult<Job> {
        let _guard = self.evaluation.lock().await;
        let mut job = self.load(id).await?;
        self.reject_expired_date(&job, &job.trigger, Utc::now())?;
        job.paused = false;
        job.next_run_time = job.trigger.first_fire_time(Utc::now())?;
        self.store.update_job(&job).await?;

        info!(job_id = %id, next_run_time = ?job.next_run_time, "恢复调度作业");
        Ok(job)
    }

    /// 替换作业的触发器
    pub async fn reschedule_job(&self, id: &str, trigger: Trigger) -> SchedulerResult<Job> {
        trigger.validate()?;

        let _guard = self.evaluation.lock().await;
        let mut job = self.load(id).await?;
        self.reject_expired_date(&job, &trigger, Utc::now())?;
        job.next_run_time = if job.paused {
            None
        } else {
            trigger.first_fire_time(Utc::now())?
        };
        job.trigger = trigger;
        self.store.update_job(&job).await?;

        info!(
            job_id = %id,
            trigger = %job.trigger.describe(),
            next_run_time = ?job.next_run_time,
            "作业已改期"
        );
        Ok(job)
    }

    pub async fn remove_job(&self, id: &str) -> SchedulerResult<()> {
        let _guard = self.evaluation.lock().await;
        self.store.remove_job(id).await?;
        info!(job_id = %id, "删除调度作业");
        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> SchedulerResult<Job> {
        self.load(id).await
    }

    pub async fn list_jobs(&self) -> SchedulerResult<Vec<Job>> {
        self.store.list_jobs().await
    }

    fn misfire_grace(&self, job: &Job) -> Duration {
        let grace_seconds = job
            .misfire_grace_seconds
            .unwrap_or(self.config.default_misfire_grace_seconds);
        Duration::try_seconds(i64::try_from(grace_seconds).unwrap_or(i64::MAX))
            .unwrap_or(Duration::MAX)
    }

    /// 一次性触发时间已超过宽限期时拒绝, 否则首次检查就会被当作错过的触发丢弃
    fn reject_expired_date(
        &self,
        job: &Job,
        trigger: &Trigger,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        if let Trigger::Date { run_at } = trigger {
            if now - *run_at > self.misfire_grace(job) {
                return Err(SchedulerError::InvalidTrigger(format!(
                    "一次性触发时间已过: {run_at}"
                )));
            }
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> SchedulerResult<Job> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    /// 评估所有到期作业
    ///
    /// 单个作业失败不会影响其他作业。
    pub async fn tick(&self, now: DateTime<Utc>) -> SchedulerResult<TickReport> {
        let _guard = self.evaluation.lock().await;
        let mut report = TickReport::default();

        for job in self.store.list_jobs().await? {
            if !job.is_due(now) {
                continue;
            }
            let job_id = job.id.clone();
            if let Err(e) = self.process_due_job(job, now, &mut report).await {
                error!(job_id = %job_id, "处理到期作业失败: {}", e);
            }
        }

        if !report.fired.is_empty() || !report.skipped.is_empty() || !report.failed.is_empty() {
            debug!(
                fired = report.fired.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                "调度检查完成"
            );
        }
        Ok(report)
    }

    async fn process_due_job(
        &self,
        mut job: Job,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> SchedulerResult<()> {
        let Some(scheduled_at) = job.next_run_time else {
            return Ok(());
        };

        let lateness = now - scheduled_at;
        let grace = self.misfire_grace(&job);

        let mut fired_task = None;
        if lateness > grace && job.coalesce {
            StructuredLogger::log_job_misfire_skipped(
                &job.id,
                scheduled_at,
                lateness.num_milliseconds(),
            );
            report.skipped.push(job.id.clone());
        } else {
            match self.fire(&job).await {
                Ok(task_id) => {
                    job.last_fired_at = Some(now);
                    report.fired.push(FiredJob {
                        job_id: job.id.clone(),
                        task_id: task_id.clone(),
                    });
                    fired_task = Some(task_id);
                }
                Err(e) => {
                    StructuredLogger::log_publish_failed(&job.id, &e);
                    MetricsCollector::record_publish_failure(&job.id);
                    report.failed.push(job.id.clone());
                }
            }
        }

        let next_run_time = job.trigger.next_fire_time(scheduled_at, now)?;
        if let Some(task_id) = &fired_task {
            StructuredLogger::log_job_fired(&job.id, task_id, next_run_time);
        }

        if next_run_time.is_none() && job.trigger.is_one_shot() {
            debug!(job_id = %job.id, "一次性作业已处理, 从存储中移除");
            return self.store.remove_job(&job.id).await;
        }
        job.next_run_time = next_run_time;
        self.store.update_job(&job).await
    }

    /// 触发只发布一条任务消息, 不等待执行
    async fn fire(&self, job: &Job) -> SchedulerResult<String> {
        let span = TaskTracer::fire_job_span(&job.id, &job.task_name);
        async {
            let message = TaskMessage::new(&job.task_name, job.args.clone(), job.kwargs.clone())
                .with_scheduled_job_id(&job.id);
            let handle = self.client.enqueue_message(&self.queue, message).await?;
            MetricsCollector::record_job_fired(&job.id);
            Ok(handle.task_id)
        }
        .instrument(span)
        .await
    }

    /// 距离最近一次到期的等待时长, 不超过检查间隔
    async fn next_wakeup(&self, now: DateTime<Utc>) -> StdDuration {
        let tick_interval = self.config.tick_interval();
        let jobs = match self.store.list_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("读取作业列表失败: {}", e);
                return tick_interval;
            }
        };

        jobs.iter()
            .filter(|job| job.is_active())
            .filter_map(|job| job.next_run_time)
            .min()
            .map(|next| (next - now).to_std().unwrap_or(StdDuration::ZERO))
            .map_or(tick_interval, |wait| wait.min(tick_interval))
    }

    /// 调度循环, 收到关闭信号后退出
    ///
    /// 只有持有租约的实例评估触发器; 正在进行的发布会在退出前完成。
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        info!(instance_id = %self.config.instance_id, queue = %self.queue, "调度器启动");
        let mut is_leader = false;

        loop {
            let wait = if is_leader {
                self.next_wakeup(Utc::now()).await
            } else {
                self.config.tick_interval()
            };

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("调度器收到关闭信号");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match self
                .store
                .try_acquire_lease(&self.config.instance_id, self.config.lease_ttl())
                .await
            {
                Ok(true) => {
                    if !is_leader {
                        info!(instance_id = %self.config.instance_id, "获得调度器租约");
                        is_leader = true;
                    }
                }
                Ok(false) => {
                    if is_leader {
                        warn!(instance_id = %self.config.instance_id, "调度器租约已被其他实例持有, 转为待命");
                    }
                    is_leader = false;
                    continue;
                }
                Err(e) => {
                    error!("获取调度器租约失败: {}", e);
                    is_leader = false;
                    continue;
                }
            }

            if let Err(e) = self.tick(Utc::now()).await {
                error!("调度检查失败: {}", e);
            }
        }

        if is_leader {
            if let Err(e) = self.store.release_lease(&self.config.instance_id).await {
                warn!("释放调度器租约失败: {}", e);
            }
        }
        info!("调度器已停止");
        Ok(())
    }
}
