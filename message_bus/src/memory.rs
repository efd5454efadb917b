use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, warn};

use crate::{topic_matches, Acknowledger, Delivery, MessageBus, Result, Subscription};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct MemoryQueue {
    ready: Mutex<VecDeque<StoredMessage>>,
    dead_letters: Mutex<Vec<StoredMessage>>,
    notify: Notify,
}

impl MemoryQueue {
    async fn push_back(&self, message: StoredMessage) {
        self.ready.lock().await.push_back(message);
        self.notify.notify_one();
    }

    async fn push_front(&self, message: StoredMessage) {
        self.ready.lock().await.push_front(message);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<StoredMessage> {
        self.ready.lock().await.pop_front()
    }
}

#[derive(Default)]
struct Inner {
    /// (queue, pattern) pairs
    bindings: RwLock<Vec<(String, String)>>,
    queues: RwLock<HashMap<String, Arc<MemoryQueue>>>,
    next_id: AtomicU64,
}

/// In-process topic broker. Publishing completes once the message is in
/// every matching queue; unacked deliveries are lost if the process exits.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn declare_queue(&self, queue: &str) -> Arc<MemoryQueue> {
        let mut queues = self.inner.queues.write().await;
        queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::default()))
            .clone()
    }

    /// Messages waiting in `queue`
    pub async fn queue_depth(&self, queue: &str) -> usize {
        match self.inner.queues.read().await.get(queue) {
            Some(q) => q.ready.lock().await.len(),
            None => 0,
        }
    }

    /// Messages rejected without requeue on `queue`
    pub async fn dead_letter_count(&self, queue: &str) -> usize {
        match self.inner.queues.read().await.get(queue) {
            Some(q) => q.dead_letters.lock().await.len(),
            None => 0,
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<()> {
        let mut targets: Vec<String> = {
            let bindings = self.inner.bindings.read().await;
            bindings
                .iter()
                .filter(|(_, pattern)| topic_matches(pattern, routing_key))
                .map(|(queue, _)| queue.clone())
                .collect()
        };
        targets.sort();
        targets.dedup();

        if targets.is_empty() {
            debug!("No queue bound for {}, message dropped", routing_key);
            return Ok(());
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let queues = self.inner.queues.read().await;
        for target in targets {
            if let Some(queue) = queues.get(&target) {
                queue
                    .push_back(StoredMessage {
                        id,
                        routing_key: routing_key.to_string(),
                        body: body.clone(),
                        redelivered: false,
                    })
                    .await;
            }
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str, pattern: &str) -> Result<Box<dyn Subscription>> {
        let handle = self.declare_queue(queue).await;
        {
            let mut bindings = self.inner.bindings.write().await;
            let binding = (queue.to_string(), pattern.to_string());
            if !bindings.contains(&binding) {
                bindings.push(binding);
            }
        }
        debug!("Subscribed to queue {} ({})", queue, pattern);
        Ok(Box::new(MemorySubscription {
            queue_name: queue.to_string(),
            queue: handle,
        }))
    }
}

struct MemorySubscription {
    queue_name: String,
    queue: Arc<MemoryQueue>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(message) = self.queue.pop().await {
                let delivery_id = format!("{}:{}", self.queue_name, message.id);
                return Ok(Some(Delivery::new(
                    delivery_id,
                    message.routing_key.clone(),
                    message.body.clone(),
                    message.redelivered,
                    Box::new(MemoryAcker {
                        queue: self.queue.clone(),
                        message,
                    }),
                )));
            }

            if tokio::time::timeout_at(deadline, self.queue.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    message: StoredMessage,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let mut message = self.message.clone();
        if requeue {
            message.redelivered = true;
            self.queue.push_front(message).await;
        } else {
            warn!("Dead-lettering message {} ({})", message.id, message.routing_key);
            self.queue.dead_letters.lock().await.push(message);
        }
        Ok(())
    }
}
