use async_trait::async_trait;

use crate::messages::Message;
use taskhub_errors::HubResult;

/// 消息队列抽象；内嵌实现为进程内mpsc队列
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish_message(&self, queue: &str, message: &Message) -> HubResult<()>;
    async fn consume_messages(&self, queue: &str) -> HubResult<Vec<Message>>;
    async fn create_queue(&self, queue: &str) -> HubResult<()>;
    async fn get_queue_size(&self, queue: &str) -> HubResult<u32>;
    async fn purge_queue(&self, queue: &str) -> HubResult<()>;
}

/// 系统内固定的队列名
pub mod queues {
    /// 调度器产生的触发请求
    pub const DISPATCH: &str = "dispatch";
    /// 待runner执行的运行
    pub const RUNS: &str = "runs";
    /// runner上报的状态与日志
    pub const STATUS: &str = "status";
    /// 控制面下发的取消指令
    pub const CONTROL: &str = "control";
}
