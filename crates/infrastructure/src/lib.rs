pub mod database;
pub mod in_memory_queue;

pub use database::sqlite::{
    SqliteProjectRepository, SqliteRunRepository, SqliteStepLogRepository, SqliteTaskRepository,
};
pub use database::{connect_sqlite, ensure_schema};
pub use in_memory_queue::InMemoryMessageQueue;
