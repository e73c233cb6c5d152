pub mod models;
pub mod secrets;

pub use models::{
    ApiConfig, AppConfig, DatabaseConfig, ObservabilityConfig, QueueConfig, RunnerConfig,
    SchedulerConfig,
};
pub use secrets::{SecretCipher, SECRET_PREFIX};
