use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

/// A message handed to a worker. It stays invisible to other receivers until
/// the visibility timeout lapses, then it is redelivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: Uuid,
    pub body: String,
    pub receipt: Uuid,
    /// 1 on first delivery.
    pub dequeue_count: u32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("receipt {0} no longer holds the message")]
    StaleReceipt(Uuid),
}

/// At-least-once work queue between discovery and the detail workers.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn send(&self, body: &str) -> Result<Uuid, QueueError>;

    async fn receive(&self, visibility_timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Removes the message. Fails with `StaleReceipt` when the message was
    /// redelivered to someone else since `delivery` was handed out.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Makes the message visible again right away.
    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError>;

    async fn approximate_len(&self) -> Result<u64, QueueError>;
}

#[derive(Debug)]
struct Slot {
    message_id: Uuid,
    body: String,
    visible_at: Instant,
    receipt: Option<Uuid>,
    dequeue_count: u32,
}

/// In-process queue with the same visibility semantics as [`crate::PgQueue`].
#[derive(Debug, Default)]
pub struct MemoryQueue {
    slots: Mutex<VecDeque<Slot>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bodies of every message still held, visible or not, oldest first.
    pub async fn pending_bodies(&self) -> Vec<String> {
        self.slots
            .lock()
            .await
            .iter()
            .map(|slot| slot.body.clone())
            .collect()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn send(&self, body: &str) -> Result<Uuid, QueueError> {
        let message_id = Uuid::new_v4();
        self.slots.lock().await.push_back(Slot {
            message_id,
            body: body.to_string(),
            visible_at: Instant::now(),
            receipt: None,
            dequeue_count: 0,
        });
        Ok(message_id)
    }

    async fn receive(&self, visibility_timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.iter_mut().find(|slot| slot.visible_at <= now) else {
            return Ok(None);
        };
        let receipt = Uuid::new_v4();
        slot.visible_at = now + visibility_timeout;
        slot.receipt = Some(receipt);
        slot.dequeue_count += 1;
        Ok(Some(Delivery {
            message_id: slot.message_id,
            body: slot.body.clone(),
            receipt,
            dequeue_count: slot.dequeue_count,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut slots = self.slots.lock().await;
        let position = slots.iter().position(|slot| {
            slot.message_id == delivery.message_id && slot.receipt == Some(delivery.receipt)
        });
        match position {
            Some(index) => {
                slots.remove(index);
                Ok(())
            }
            None => Err(QueueError::StaleReceipt(delivery.receipt)),
        }
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .iter_mut()
            .find(|slot| {
                slot.message_id == delivery.message_id && slot.receipt == Some(delivery.receipt)
            })
            .ok_or(QueueError::StaleReceipt(delivery.receipt))?;
        slot.visible_at = Instant::now();
        slot.receipt = None;
        Ok(())
    }

    async fn approximate_len(&self) -> Result<u64, QueueError> {
        Ok(self.slots.lock().await.len() as u64)
    }
}
