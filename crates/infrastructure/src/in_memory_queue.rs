use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use taskhub_config::QueueConfig;
use taskhub_domain::messages::Message;
use taskhub_domain::messaging::MessageQueue;
use taskhub_errors::{HubError, HubResult};

/// 进程内消息队列
///
/// 调度器、分发器、runner同进程部署时的默认队列实现。
/// 消息不落盘，进程退出即丢失；状态恢复依赖数据库中的运行记录。
pub struct InMemoryMessageQueue {
    queues: Arc<RwLock<HashMap<String, QueueChannel>>>,
    capacity: usize,
}

struct QueueChannel {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    size: Arc<AtomicU32>,
}

impl InMemoryMessageQueue {
    pub fn new(config: &QueueConfig) -> Self {
        info!("创建进程内消息队列, 单队列容量: {}", config.capacity);
        Self {
            queues: Arc::new(RwLock::new(HashMap::new())),
            capacity: config.capacity,
        }
    }

    async fn get_or_create(&self, queue_name: &str) -> QueueHandles {
        {
            let queues = self.queues.read().await;
            if let Some(channel) = queues.get(queue_name) {
                return QueueHandles {
                    sender: channel.sender.clone(),
                    receiver: channel.receiver.clone(),
                    size: channel.size.clone(),
                };
            }
        }

        let mut queues = self.queues.write().await;
        let channel = queues.entry(queue_name.to_string()).or_insert_with(|| {
            debug!("创建队列: {}", queue_name);
            let (sender, receiver) = mpsc::unbounded_channel();
            QueueChannel {
                sender,
                receiver: Arc::new(Mutex::new(receiver)),
                size: Arc::new(AtomicU32::new(0)),
            }
        });
        QueueHandles {
            sender: channel.sender.clone(),
            receiver: channel.receiver.clone(),
            size: channel.size.clone(),
        }
    }
}

struct QueueHandles {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    size: Arc<AtomicU32>,
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn publish_message(&self, queue: &str, message: &Message) -> HubResult<()> {
        let handles = self.get_or_create(queue).await;

        let current = handles.size.load(Ordering::Relaxed) as usize;
        if current >= self.capacity {
            warn!("队列 '{}' 已满({}), 拒绝消息 {}", queue, current, message.id);
            return Err(HubError::queue_error(format!("队列 '{queue}' 已满")));
        }

        handles
            .sender
            .send(message.clone())
            .map_err(|e| HubError::queue_error(format!("向队列 '{queue}' 投递失败: {e}")))?;
        handles.size.fetch_add(1, Ordering::Relaxed);

        debug!("消息 {} 已投递到队列 '{}'", message.id, queue);
        Ok(())
    }

    async fn consume_messages(&self, queue: &str) -> HubResult<Vec<Message>> {
        let handles = self.get_or_create(queue).await;

        let mut messages = Vec::new();
        {
            let mut rx = handles.receiver.lock().await;
            while let Ok(message) = rx.try_recv() {
                messages.push(message);
            }
        }

        if !messages.is_empty() {
            handles
                .size
                .fetch_sub(messages.len() as u32, Ordering::Relaxed);
            debug!("从队列 '{}' 取出 {} 条消息", queue, messages.len());
        }
        Ok(messages)
    }

    async fn create_queue(&self, queue: &str) -> HubResult<()> {
        self.get_or_create(queue).await;
        Ok(())
    }

    async fn get_queue_size(&self, queue: &str) -> HubResult<u32> {
        let queues = self.queues.read().await;
        queues
            .get(queue)
            .map(|channel| channel.size.load(Ordering::Relaxed))
            .ok_or_else(|| HubError::queue_error(format!("队列 '{queue}' 不存在")))
    }

    async fn purge_queue(&self, queue: &str) -> HubResult<()> {
        let handles = self.get_or_create(queue).await;
        let mut purged = 0u32;
        {
            let mut rx = handles.receiver.lock().await;
            while rx.try_recv().is_ok() {
                purged += 1;
            }
        }
        handles.size.store(0, Ordering::Relaxed);
        info!("清空队列 '{}': {} 条消息", queue, purged);
        Ok(())
    }
}
