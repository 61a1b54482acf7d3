//! 跨组件链路传播
//!
//! 入队方把当前 span 的上下文按 W3C Trace Context 写入 [`MessageHeaders::trace_context`]，
//! 工作进程从中恢复父上下文，使任务执行 span 与触发它的调用处于同一条链路。
//!
//! [`MessageHeaders::trace_context`]: scheduler_core::models::MessageHeaders

use std::collections::HashMap;

use opentelemetry::global;
use opentelemetry::propagation::{Extractor, Injector};
use tracing_opentelemetry::OpenTelemetrySpanExt;

struct HeaderExtractor<'a>(&'a HashMap<String, String>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

struct HeaderInjector<'a>(&'a mut HashMap<String, String>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

pub struct CrossComponentTracer;

impl CrossComponentTracer {
    /// 把当前 span 的上下文写入消息头
    pub fn inject_current_context(headers: &mut HashMap<String, String>) {
        let context = tracing::Span::current().context();
        let mut injector = HeaderInjector(headers);
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&context, &mut injector)
        });
    }

    /// 返回当前 span 的链路上下文
    pub fn current_context_headers() -> HashMap<String, String> {
        let mut headers = HashMap::new();
        Self::inject_current_context(&mut headers);
        headers
    }

    pub fn extract_context(headers: &HashMap<String, String>) -> opentelemetry::Context {
        let extractor = HeaderExtractor(headers);
        global::get_text_map_propagator(|propagator| propagator.extract(&extractor))
    }

    /// 以消息头中的远端上下文作为 `span` 的父上下文
    pub fn link_remote_parent(span: &tracing::Span, headers: &HashMap<String, String>) {
        if headers.is_empty() {
            return;
        }
        span.set_parent(Self::extract_context(headers));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };
    use opentelemetry_sdk::propagation::TraceContextPropagator;

    #[test]
    fn test_traceparent_round_trip() {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let span_context = SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        let context = opentelemetry::Context::new().with_remote_span_context(span_context);

        let mut headers = HashMap::new();
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&context, &mut HeaderInjector(&mut headers))
        });
        assert_eq!(
            headers.get("traceparent").map(String::as_str),
            Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        );

        let extracted = CrossComponentTracer::extract_context(&headers);
        let extracted_span = extracted.span();
        let extracted_context = extracted_span.span_context();
        assert_eq!(
            extracted_context.trace_id(),
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
        );
        assert!(extracted_context.is_remote());
    }

    #[test]
    fn test_no_active_span_injects_nothing() {
        global::set_text_map_propagator(TraceContextPropagator::new());
        let headers = CrossComponentTracer::current_context_headers();
        assert!(headers.get("traceparent").is_none());
    }
}
