//! 状态与控制API
//!
//! 控制台轮询用的只读端点，加上少量幂等控制动作。写路径只落库或
//! 发消息，不直接驱动执行。

pub mod error;
pub mod handlers;
pub mod response;
pub mod routes;

pub use error::{ApiError, ApiResult};
pub use response::ApiResponse;
pub use routes::{create_routes, serve, AppState};
