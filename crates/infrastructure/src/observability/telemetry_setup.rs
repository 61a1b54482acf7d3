use std::net::SocketAddr;

use anyhow::{Context, Result};
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{propagation::TraceContextPropagator, trace::SdkTracerProvider, Resource};
use opentelemetry_semantic_conventions::resource;
use scheduler_core::config::{LogFormat, ObservabilityConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 持有链路追踪提供者, 进程退出前调用 [`ObservabilityGuard::shutdown`] 刷新未导出的 span
pub struct ObservabilityGuard {
    tracer_provider: SdkTracerProvider,
}

impl ObservabilityGuard {
    pub fn shutdown(self) {
        if let Err(e) = self.tracer_provider.shutdown() {
            warn!("关闭链路追踪提供者失败: {}", e);
        }
        info!("可观测性组件已关闭");
    }
}

fn build_tracer_provider(config: &ObservabilityConfig) -> Result<SdkTracerProvider> {
    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attribute(KeyValue::new(
            resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .build();

    let mut builder = SdkTracerProvider::builder().with_resource(resource);
    if let Some(endpoint) = &config.otlp_endpoint {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint.clone())
            .build()
            .context("创建 OTLP span 导出器失败")?;
        builder = builder.with_batch_exporter(exporter);
    }

    Ok(builder.build())
}

/// 初始化日志与链路追踪
///
/// `RUST_LOG` 优先于配置中的日志级别。链路追踪提供者总会安装，
/// 以便 span 携带 OpenTelemetry 上下文并写入任务消息头；
/// 只有配置了 `otlp_endpoint` 时 span 才会被导出。
pub fn init_observability(config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("无效的日志级别")?;

    let tracer_provider = build_tracer_provider(config)?;
    let tracer = tracer_provider.tracer(config.service_name.clone());
    global::set_tracer_provider(tracer_provider.clone());
    global::set_text_map_propagator(TraceContextPropagator::new());

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_opentelemetry::layer().with_tracer(tracer));

    let initialized = match config.log_format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .try_init(),
    };
    initialized.context("初始化日志订阅器失败")?;

    if config.metrics_enabled {
        init_metrics(&config.metrics_bind_address)?;
    }

    info!(
        logging.format = ?config.log_format,
        logging.level = %config.log_level,
        otlp.enabled = config.otlp_endpoint.is_some(),
        metrics.enabled = config.metrics_enabled,
        "可观测性组件初始化完成"
    );

    Ok(ObservabilityGuard { tracer_provider })
}

/// 安装 Prometheus 导出器, 在 `bind_address` 上提供 `/metrics`
pub fn init_metrics(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装 Prometheus 指标导出器失败")?;

    info!("Prometheus 指标导出器监听于 {}", addr);
    Ok(())
}
