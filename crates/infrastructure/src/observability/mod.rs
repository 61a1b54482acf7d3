//! 可观测性
//!
//! - 日志与链路追踪初始化 (`tracing-subscriber` + OpenTelemetry)
//! - Prometheus 指标导出
//! - 任务消息头中的 W3C 链路上下文传播

pub mod cross_component_tracer;
pub mod metrics_collector;
pub mod structured_logger;
pub mod task_tracer;
pub mod telemetry_setup;

pub use cross_component_tracer::CrossComponentTracer;
pub use metrics_collector::MetricsCollector;
pub use structured_logger::StructuredLogger;
pub use task_tracer::TaskTracer;
pub use telemetry_setup::{init_metrics, init_observability, ObservabilityGuard};
