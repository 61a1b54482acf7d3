pub mod execution_tracker;
pub mod job_store;
pub mod message_queue;
pub mod result_backend;
pub mod task_handler;

pub use execution_tracker::*;
pub use job_store::*;
pub use message_queue::*;
pub use result_backend::*;
pub use task_handler::*;
