use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use scheduler_core::config::{AppConfig, LogFormat};
use scheduler_infrastructure::init_observability;
use tracing::{error, info, warn};

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::ShutdownManager;

/// 排空工作池之外额外等待的时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("scheduler")
        .version(env!("CARGO_PKG_VERSION"))
        .about("后台任务调度系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径, 未指定时依次查找默认路径"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["scheduler", "worker", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别, 覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式, 覆盖配置文件")
                .value_parser(["json", "pretty", "compact"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mode_str = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all");

    let mut config = AppConfig::load(config_path)
        .with_context(|| format!("加载配置失败: {}", config_path.unwrap_or("<默认路径>")))?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format
            .parse::<LogFormat>()
            .map_err(|e| anyhow::anyhow!(e))?;
    }

    let observability = init_observability(&config.observability)?;

    info!("启动后台任务调度系统");
    info!("运行模式: {mode_str}");

    let app_mode = AppMode::parse(mode_str, &config)?;
    let shutdown_timeout = config.worker.drain_timeout() + SHUTDOWN_GRACE;

    let app = Arc::new(Application::new(config, app_mode).await?);
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe();
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    let finished_early = tokio::select! {
        _ = shutdown::wait_for_signal() => None,
        result = &mut app_handle => Some(result),
    };

    match finished_early {
        Some(result) => match result {
            Ok(Ok(())) => warn!("应用在收到关闭信号前退出"),
            Ok(Err(e)) => error!("应用运行失败: {e:#}"),
            Err(e) => error!("应用任务异常退出: {e}"),
        },
        None => {
            info!("收到关闭信号，开始优雅关闭...");
            shutdown_manager.trigger();

            match tokio::time::timeout(shutdown_timeout, app_handle).await {
                Ok(Ok(Ok(()))) => info!("应用已优雅关闭"),
                Ok(Ok(Err(e))) => error!("应用关闭时发生错误: {e:#}"),
                Ok(Err(e)) => error!("应用任务异常退出: {e}"),
                Err(_) => warn!("应用关闭超时，强制退出"),
            }
        }
    }

    if let Err(e) = app.shutdown().await {
        error!("{e:#}");
    }
    observability.shutdown();

    info!("后台任务调度系统已退出");
    Ok(())
}
