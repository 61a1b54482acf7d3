use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use scheduler_core::{models::Job, traits::JobStore, SchedulerError, SchedulerResult};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// 进程内作业存储
///
/// 进程重启后作业需要重新注册。租约只在本进程内有意义，
/// 同一进程内只会有一个调度器持有它。
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
    lease: Mutex<Option<(String, Instant)>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn add_job(&self, job: &Job) -> SchedulerResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(SchedulerError::DuplicateJob { id: job.id.clone() });
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> SchedulerResult<()> {
        match self.jobs.write().await.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(SchedulerError::JobNotFound { id: job.id.clone() }),
        }
    }

    async fn remove_job(&self, id: &str) -> SchedulerResult<()> {
        self.jobs
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    async fn get_job(&self, id: &str) -> SchedulerResult<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn list_jobs(&self) -> SchedulerResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    async fn try_acquire_lease(&self, holder: &str, ttl: Duration) -> SchedulerResult<bool> {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .ok_or_else(|| SchedulerError::Lease(format!("无效的租约时长: {ttl:?}")))?;
        let mut lease = self.lease.lock().await;
        let available = match lease.as_ref() {
            Some((current, expires_at)) => current == holder || *expires_at <= now,
            None => true,
        };
        if available {
            *lease = Some((holder.to_string(), expires_at));
        }
        Ok(available)
    }

    async fn release_lease(&self, holder: &str) -> SchedulerResult<()> {
        let mut lease = self.lease.lock().await;
        if lease.as_ref().is_some_and(|(current, _)| current == holder) {
            *lease = None;
        }
        Ok(())
    }
}
