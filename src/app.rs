use std::sync::Arc;

use anyhow::{Context, Result};
use scheduler_core::config::AppConfig;
use scheduler_dispatcher::{install_retention, retention::register_retention_task, Scheduler};
use scheduler_infrastructure::SchedulerContext;
use scheduler_worker::WorkerPool;
use tokio::sync::broadcast;
use tracing::{error, info};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行调度器
    Scheduler,
    /// 仅运行工作池
    Worker,
    /// 同一进程内运行调度器和工作池
    All,
}

impl AppMode {
    pub fn parse(mode: &str, config: &AppConfig) -> Result<Self> {
        let mode = match mode {
            "scheduler" => AppMode::Scheduler,
            "worker" => AppMode::Worker,
            "all" => AppMode::All,
            _ => return Err(anyhow::anyhow!("不支持的运行模式: {mode}")),
        };
        if mode == AppMode::Scheduler && !config.scheduler.enabled {
            return Err(anyhow::anyhow!("调度器被禁用，请检查配置"));
        }
        if mode == AppMode::Worker && !config.worker.enabled {
            return Err(anyhow::anyhow!("Worker被禁用，请检查配置"));
        }
        Ok(mode)
    }

    fn runs_scheduler(&self, config: &AppConfig) -> bool {
        match self {
            AppMode::Scheduler => true,
            AppMode::Worker => false,
            AppMode::All => config.scheduler.enabled,
        }
    }

    fn runs_worker(&self, config: &AppConfig) -> bool {
        match self {
            AppMode::Scheduler => false,
            AppMode::Worker => true,
            AppMode::All => config.worker.enabled,
        }
    }
}

/// 主应用程序
pub struct Application {
    mode: AppMode,
    context: Arc<SchedulerContext>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);
        let context = SchedulerContext::from_config(config)
            .await
            .context("创建调度上下文失败")?;
        Ok(Self::from_context(Arc::new(context), mode))
    }

    pub fn from_context(context: Arc<SchedulerContext>, mode: AppMode) -> Self {
        Self { mode, context }
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let config = self.context.config();
        let run_scheduler = self.mode.runs_scheduler(config);
        let run_worker = self.mode.runs_worker(config);
        info!(
            mode = ?self.mode,
            scheduler = run_scheduler,
            worker = run_worker,
            "启动应用程序"
        );

        self.context.start_background_services().await;

        let mut handles = Vec::new();

        if run_scheduler {
            let scheduler = Scheduler::from_context(&self.context);
            install_retention(
                &self.context.registry(),
                self.context.tracker(),
                &scheduler,
                &config.tracker,
            )
            .await
            .context("安装执行记录清理作业失败")?;

            let shutdown_rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = scheduler.run(shutdown_rx).await {
                    error!("调度器运行失败: {}", e);
                }
            }));
        } else if run_worker {
            // 清理作业可能由其他进程中的调度器触发
            register_retention_task(
                &self.context.registry(),
                self.context.tracker(),
                config.tracker.retention_days,
            )
            .await
            .context("注册执行记录清理任务失败")?;
        }

        if run_worker {
            let pool = WorkerPool::from_context(&self.context);
            let shutdown_rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = pool.run(shutdown_rx).await {
                    error!("工作池运行失败: {}", e);
                }
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("组件异常退出: {}", e);
            }
        }

        info!("所有组件已停止");
        Ok(())
    }

    /// 释放调度上下文持有的连接
    pub async fn shutdown(&self) -> Result<()> {
        self.context
            .shutdown()
            .await
            .context("关闭调度上下文失败")
    }
}
