use std::sync::Arc;
use std::time::Duration;

use scheduler_core::{traits::ResultBackend, SchedulerResult};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// 结果清理服务
///
/// 按固定间隔调用 [`ResultBackend::cleanup_expired`]，防止关系型结果表无限增长。
/// 键值存储依赖自身的 TTL 淘汰，不需要启动该服务。
pub struct ResultCleanupService {
    results: Arc<dyn ResultBackend>,
    interval: Duration,
    shutdown_tx: Option<oneshot::Sender<()>>,
    cleanup_handle: Option<JoinHandle<()>>,
}

impl ResultCleanupService {
    pub fn new(results: Arc<dyn ResultBackend>, interval: Duration) -> Self {
        Self {
            results,
            interval,
            shutdown_tx: None,
            cleanup_handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.cleanup_handle.is_some()
    }

    /// 启动清理服务
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        info!(
            backend = self.results.backend_name(),
            interval_seconds = self.interval.as_secs(),
            "启动结果清理服务"
        );

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let results = self.results.clone();
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即返回, 跳过以免启动时就清理
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = Self::perform_cleanup(results.as_ref()).await {
                            error!("清理过期结果失败: {}", e);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("结果清理服务收到停止信号");
                        break;
                    }
                }
            }
        });

        self.cleanup_handle = Some(handle);
    }

    /// 停止清理服务
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(handle) = self.cleanup_handle.take() {
            if let Err(e) = handle.await {
                warn!("等待结果清理服务停止时出错: {}", e);
            }
            info!("结果清理服务已停止");
        }
    }

    /// 立即执行一次清理
    pub async fn cleanup_once(&self) -> SchedulerResult<u64> {
        Self::perform_cleanup(self.results.as_ref()).await
    }

    async fn perform_cleanup(results: &dyn ResultBackend) -> SchedulerResult<u64> {
        let start_time = std::time::Instant::now();
        let cleaned = results.cleanup_expired().await?;
        if cleaned > 0 {
            info!(
                cleaned,
                duration_ms = start_time.elapsed().as_millis() as u64,
                "已清理过期任务结果"
            );
        }
        Ok(cleaned)
    }
}
