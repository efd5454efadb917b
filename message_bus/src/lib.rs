//! Topic-based publish/subscribe transport with manual acknowledgement.
//!
//! Two backends share one trait: [`InMemoryBus`] for single-process
//! deployments and tests, and [`RedisBus`] for durable queues shared by
//! several service instances. Delivery is at-least-once in both.

pub mod memory;
pub mod redis_bus;
pub mod topic;

pub use memory::InMemoryBus;
pub use redis_bus::RedisBus;
pub use topic::topic_matches;

use async_trait::async_trait;
use persistence_layer::PersistenceError;
use retry_utils::{retry_async, ErrorClass, RetryPolicy};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Broker transport error: {0}")]
    Transport(String),
    #[error("Message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Message body is not valid UTF-8")]
    InvalidBody,
}

impl From<PersistenceError> for BusError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Serialization(e) => BusError::Serialization(e),
            other => BusError::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, BusError>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Route `body` to every queue bound to a matching pattern. Returns once
    /// the broker has accepted the message.
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<()>;

    /// Declare `queue`, bind it to `pattern` and start consuming from it.
    /// Several subscriptions on the same queue compete for deliveries.
    async fn subscribe(&self, queue: &str, pattern: &str) -> Result<Box<dyn Subscription>>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait up to `wait` for the next delivery
    async fn next_delivery(&mut self, wait: Duration) -> Result<Option<Delivery>>;
}

/// Settles a delivery with the broker it came from
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

pub struct Delivery {
    pub delivery_id: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_id: String,
        routing_key: String,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_id,
            routing_key,
            body,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject the delivery; `requeue = false` sends it to the dead-letter store
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_id", &self.delivery_id)
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Publishes JSON messages, retrying transient broker failures
#[derive(Clone)]
pub struct ReliablePublisher {
    bus: Arc<dyn MessageBus>,
    policy: RetryPolicy,
}

impl ReliablePublisher {
    pub fn new(bus: Arc<dyn MessageBus>, policy: RetryPolicy) -> Self {
        Self { bus, policy }
    }

    pub fn bus(&self) -> Arc<dyn MessageBus> {
        self.bus.clone()
    }

    pub async fn publish_json<T: Serialize + Sync>(&self, routing_key: &str, message: &T) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        let bus = &self.bus;
        let body = &body;
        retry_async(
            routing_key,
            &self.policy,
            move || bus.publish(routing_key, body.clone()),
            |e: &BusError| match e {
                BusError::Transport(_) => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
        )
        .await
    }
}
