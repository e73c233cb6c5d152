pub mod entities;
pub mod messages;
pub mod messaging;
pub mod repositories;

pub use entities::*;
pub use messages::*;
pub use messaging::MessageQueue;
pub use repositories::{
    ProjectRepository, RunRepository, StepLogRepository, TaskRepository,
};
