pub mod executors;
pub mod orchestrator;
pub mod params;
pub mod registry;
pub mod service;

pub use executors::{OutputLine, StepContext, StepExecutor, StepOutcome};
pub use orchestrator::StepOrchestrator;
pub use registry::ExecutorRegistry;
pub use service::RunnerService;
