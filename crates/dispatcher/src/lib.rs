pub mod dispatch;
pub mod scheduler;
pub mod state_listener;
pub mod trigger;

pub use dispatch::RunDispatcher;
pub use scheduler::TaskScheduler;
pub use state_listener::StateListener;
pub use trigger::TriggerEngine;
