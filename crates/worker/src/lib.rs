//! 工作进程: 从消息队列消费任务消息, 经中间件流水线执行已注册的处理函数。

pub mod middleware;
pub mod pipeline;
pub mod pool;

pub use middleware::{ExecutionContext, Middleware, Outcome};
pub use pipeline::{build_pipeline, Pipeline, PipelineDeps};
pub use pool::WorkerPool;
