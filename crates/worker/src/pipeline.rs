use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use scheduler_core::{
    config::ResultBackendFailurePolicy,
    traits::{ExecutionTracker, MessageQueue, ResultBackend, TaskArgs, TaskContext},
    TaskError,
};
use scheduler_infrastructure::SchedulerContext;
use tracing::{error, Instrument};

use crate::middleware::{
    ExecutionContext, MetricsMiddleware, Middleware, Outcome, RetryMiddleware, TracingMiddleware,
    TrackingMiddleware,
};

/// 构建流水线所需的依赖
#[derive(Clone)]
pub struct PipelineDeps {
    pub broker: Arc<dyn MessageQueue>,
    pub tracker: Arc<dyn ExecutionTracker>,
    pub results: Arc<dyn ResultBackend>,
    pub result_ttl: Duration,
    pub failure_policy: ResultBackendFailurePolicy,
    pub store_args_snapshot: bool,
}

impl PipelineDeps {
    pub fn from_context(context: &SchedulerContext) -> Self {
        let config = context.config();
        Self {
            broker: context.broker(),
            tracker: context.tracker(),
            results: context.results(),
            result_ttl: config.result_backend.ttl(),
            failure_policy: config.result_backend.failure_policy,
            store_args_snapshot: config.tracker.store_args_snapshot,
        }
    }
}

/// 中间件流水线, 顺序在构建时确定
pub struct Pipeline {
    layers: Vec<Arc<dyn Middleware>>,
}

/// 按固定顺序 Retry → Metrics → Tracing → Tracking 组装流水线
pub fn build_pipeline(deps: &PipelineDeps) -> Pipeline {
    Pipeline {
        layers: vec![
            Arc::new(RetryMiddleware::new(
                deps.broker.clone(),
                deps.tracker.clone(),
                deps.results.clone(),
                deps.result_ttl,
            )),
            Arc::new(MetricsMiddleware),
            Arc::new(TracingMiddleware),
            Arc::new(TrackingMiddleware::new(
                deps.tracker.clone(),
                deps.results.clone(),
                deps.result_ttl,
                deps.failure_policy,
                deps.store_args_snapshot,
            )),
        ],
    }
}

impl Pipeline {
    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|layer| layer.name()).collect()
    }

    pub async fn execute(&self, ctx: &mut ExecutionContext) -> Outcome {
        let mut entered = 0;
        let mut rejected = None;
        for layer in &self.layers {
            if let Err(error) = layer.before(ctx).await {
                rejected = Some(Outcome::Error(error));
                break;
            }
            entered += 1;
        }

        let mut outcome = match rejected {
            Some(outcome) => outcome,
            None => Self::invoke_handler(ctx).await,
        };
        for layer in self.layers[..entered].iter().rev() {
            outcome = layer.after(ctx, outcome).await;
        }
        outcome
    }

    /// 超时按处理函数失败处理; 处理函数 panic 转换为错误结果
    async fn invoke_handler(ctx: &ExecutionContext) -> Outcome {
        let task = ctx.task.clone();
        let timeout = task.options.timeout;
        let task_ctx = TaskContext::new(&ctx.message, task.options.max_attempts, timeout);
        let args = TaskArgs::from_message(&ctx.message);

        let call = AssertUnwindSafe(task.handler.handle(task_ctx, args))
            .catch_unwind()
            .instrument(ctx.span.clone());

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(Ok(value))) => Outcome::Success(value),
            Ok(Ok(Err(error))) => Outcome::Error(error),
            Ok(Err(_)) => {
                error!(task_id = %ctx.task_id(), task_name = %ctx.task_name(), "处理函数 panic");
                Outcome::Error(TaskError::new("Panic", "处理函数 panic"))
            }
            Err(_) => Outcome::Error(TaskError::timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use scheduler_core::{
        models::TaskMessage,
        traits::{HandlerResult, TaskHandler},
        TaskOptions, TaskRegistry,
    };
    use serde_json::{json, Map};
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        reject: bool,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn before(&self, _ctx: &mut ExecutionContext) -> Result<(), TaskError> {
            self.log.lock().unwrap().push(format!("before:{}", self.name));
            if self.reject {
                return Err(TaskError::permanent("rejected"));
            }
            Ok(())
        }

        async fn after(&self, _ctx: &mut ExecutionContext, outcome: Outcome) -> Outcome {
            self.log.lock().unwrap().push(format!("after:{}", self.name));
            outcome
        }
    }

    async fn ok(_ctx: TaskContext, _args: TaskArgs) -> HandlerResult {
        Ok(json!("done"))
    }

    async fn slow(_ctx: TaskContext, _args: TaskArgs) -> HandlerResult {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(json!(null))
    }

    async fn boom(_ctx: TaskContext, _args: TaskArgs) -> HandlerResult {
        panic!("boom")
    }

    async fn context_for<H>(name: &str, options: TaskOptions, handler: H) -> ExecutionContext
    where
        H: TaskHandler + 'static,
    {
        let registry = TaskRegistry::new();
        registry.register_task(name, handler, options).await.unwrap();
        let task = registry.get(name).await.unwrap();
        ExecutionContext::new("tasks", TaskMessage::new(name, vec![], Map::new()), task, "w1")
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>, reject: bool) -> Arc<dyn Middleware> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
            reject,
        })
    }

    #[tokio::test]
    async fn test_onion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline {
            layers: vec![recorder("outer", &log, false), recorder("inner", &log, false)],
        };
        let mut ctx = context_for("ok", TaskOptions::default(), ok).await;

        let outcome = pipeline.execute(&mut ctx).await;
        assert_eq!(outcome, Outcome::Success(json!("done")));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:outer", "before:inner", "after:inner", "after:outer"]
        );
    }

    #[tokio::test]
    async fn test_rejected_before_skips_handler_and_inner_layers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline {
            layers: vec![
                recorder("outer", &log, false),
                recorder("gate", &log, true),
                recorder("inner", &log, false),
            ],
        };
        let mut ctx = context_for("ok", TaskOptions::default(), ok).await;

        let outcome = pipeline.execute(&mut ctx).await;
        assert!(matches!(outcome, Outcome::Error(ref e) if e.message == "rejected"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:outer", "before:gate", "after:outer"]
        );
    }

    #[tokio::test]
    async fn test_timeout_becomes_error() {
        let pipeline = Pipeline { layers: vec![] };
        let options = TaskOptions::default().with_timeout(Duration::from_millis(20));
        let mut ctx = context_for("slow", options, slow).await;

        match pipeline.execute(&mut ctx).await {
            Outcome::Error(error) => assert_eq!(error.kind, "Timeout"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let pipeline = Pipeline { layers: vec![] };
        let mut ctx = context_for("boom", TaskOptions::default(), boom).await;

        match pipeline.execute(&mut ctx).await {
            Outcome::Error(error) => assert_eq!(error.kind, "Panic"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
