pub mod sqlite_project_repository;
pub mod sqlite_run_repository;
pub mod sqlite_step_log_repository;
pub mod sqlite_task_repository;

pub use sqlite_project_repository::SqliteProjectRepository;
pub use sqlite_run_repository::SqliteRunRepository;
pub use sqlite_step_log_repository::SqliteStepLogRepository;
pub use sqlite_task_repository::SqliteTaskRepository;
