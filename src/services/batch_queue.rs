//! 批次队列服务 - 业务能力层
//!
//! 只负责"带超时地取出一条原始消息"，解析交给消费循环

use crate::error::QueueError;
use crate::models::Batch;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// FIFO 批次队列
#[async_trait]
pub trait BatchQueue: Send {
    /// 阻塞等待最多 `timeout`；超时返回 `Ok(None)`
    async fn pop(&mut self, timeout: Duration) -> Result<Option<String>, QueueError>;

    fn name(&self) -> &str;
}

/// Redis 列表队列（BLPOP / RPUSH）
pub struct RedisBatchQueue {
    queue: String,
    conn: MultiplexedConnection,
}

impl RedisBatchQueue {
    pub async fn connect(redis_url: &str, queue: impl Into<String>) -> Result<Self, QueueError> {
        let queue = queue.into();
        info!("正在连接 Redis 队列 {}", queue);

        let client =
            redis::Client::open(redis_url).map_err(|e| QueueError::redis(queue.clone(), e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::redis(queue.clone(), e))?;

        info!("✓ Redis 队列 {} 已连接", queue);
        Ok(Self { queue, conn })
    }

    /// 生产端：把一批地址追加到队尾
    pub async fn push(&mut self, batch: &Batch) -> Result<(), QueueError> {
        let payload = serde_json::to_string(batch)?;
        let _: i64 = redis::cmd("RPUSH")
            .arg(&self.queue)
            .arg(payload)
            .query_async(&mut self.conn)
            .await
            .map_err(|e| QueueError::redis(self.queue.clone(), e))?;
        Ok(())
    }
}

#[async_trait]
impl BatchQueue for RedisBatchQueue {
    async fn pop(&mut self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let reply: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&self.queue)
            .arg(timeout.as_secs_f64())
            .query_async(&mut self.conn)
            .await
            .map_err(|e| QueueError::redis(self.queue.clone(), e))?;
        Ok(reply.map(|(_key, payload)| payload))
    }

    fn name(&self) -> &str {
        &self.queue
    }
}

/// 进程内队列，测试和本地调试使用
pub struct MemoryBatchQueue {
    name: String,
    rx: mpsc::UnboundedReceiver<String>,
}

/// 进程内队列的发送端
#[derive(Clone)]
pub struct MemoryQueueSender {
    tx: mpsc::UnboundedSender<String>,
}

impl MemoryQueueSender {
    pub fn push_raw(&self, payload: impl Into<String>) -> bool {
        self.tx.send(payload.into()).is_ok()
    }

    pub fn push(&self, batch: &Batch) -> bool {
        match serde_json::to_string(batch) {
            Ok(payload) => self.push_raw(payload),
            Err(_) => false,
        }
    }
}

impl MemoryBatchQueue {
    pub fn new(name: impl Into<String>) -> (MemoryQueueSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryQueueSender { tx },
            Self {
                name: name.into(),
                rx,
            },
        )
    }
}

#[async_trait]
impl BatchQueue for MemoryBatchQueue {
    async fn pop(&mut self, timeout: Duration) -> Result<Option<String>, QueueError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(payload)) => Ok(Some(payload)),
            Ok(None) => Err(QueueError::Closed {
                queue: self.name.clone(),
            }),
            Err(_) => Ok(None),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
