pub mod execution_tracker;
pub mod job_store;
pub mod result_backend;

pub use execution_tracker::SqliteExecutionTracker;
pub use job_store::SqliteJobStore;
pub use result_backend::SqliteResultBackend;
