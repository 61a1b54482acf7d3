//! # 数据模型
//!
//! 任务调度子系统的核心数据结构。
//!
//! ## 核心模型
//!
//! ### Job - 调度作业
//! 由调度器独占持有的定时定义：触发器 + 目标任务名 + 参数。
//!
//! ### TaskMessage - 任务消息
//! 发布到消息队列的传输信封，每次入队生成唯一的 `task_id`。
//!
//! ### ExecutionRecord - 执行记录
//! 执行追踪器中的条目，记录状态、耗时与尝试次数。
//!
//! ### TaskResult - 任务结果
//! 结果后端中保存的最终返回值或错误。
//!
//! ## 状态流转
//!
//! ```text
//! pending → running → success
//!                   ↘ failed → retrying → pending (下一次尝试)
//!                            ↘ dead_lettered
//! ```
//!
//! 终态 (`success`, `dead_lettered`) 只会写入一次，之后不再变化。

pub mod execution;
pub mod job;
pub mod message;
pub mod task_result;

pub use execution::*;
pub use job::*;
pub use message::*;
pub use task_result::*;
