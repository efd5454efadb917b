use async_trait::async_trait;
use persistence_layer::{ClaimedMessage, QueuedMessage, RedisClient};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{topic_matches, Acknowledger, BusError, Delivery, MessageBus, Result, Subscription};

/// Durable topic bus over Redis lists. Each queue has a ready list and a
/// processing list; claimed messages stay in the processing list until acked.
#[derive(Clone)]
pub struct RedisBus {
    client: RedisClient,
}

impl RedisBus {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }

    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = RedisClient::new(redis_url).await?;
        info!("Connected Redis message bus");
        Ok(Self::new(client))
    }

    /// Move messages left in `queue`'s processing list by a crashed consumer
    /// back to the ready list. Call before starting consumers.
    pub async fn recover_in_flight(&self, queue: &str) -> Result<u64> {
        let recovered = self.client.recover_in_flight(queue).await?;
        if recovered > 0 {
            info!("Recovered {} in-flight messages on {}", recovered, queue);
        }
        Ok(recovered)
    }

    pub async fn dead_letter_count(&self, queue: &str) -> Result<u64> {
        Ok(self.client.get_dead_letter_size(queue).await?)
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<()> {
        let body = String::from_utf8(body).map_err(|_| BusError::InvalidBody)?;
        let bindings = self.client.get_bindings().await?;
        let mut targets: Vec<String> = bindings
            .into_iter()
            .filter(|(_, pattern)| topic_matches(pattern, routing_key))
            .map(|(queue, _)| queue)
            .collect();
        targets.sort();

        if targets.is_empty() {
            debug!("No queue bound for {}, message dropped", routing_key);
            return Ok(());
        }

        let message = QueuedMessage::new(routing_key, body);
        self.client.push_to_queues(&targets, &message).await?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str, pattern: &str) -> Result<Box<dyn Subscription>> {
        self.client.bind_queue(queue, pattern).await?;
        Ok(Box::new(RedisSubscription {
            client: self.client.clone(),
            queue: queue.to_string(),
        }))
    }
}

struct RedisSubscription {
    client: RedisClient,
    queue: String,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_delivery(&mut self, wait: Duration) -> Result<Option<Delivery>> {
        // BLMOVE timeout 0 blocks forever
        let wait_seconds = wait.as_secs().max(1);
        let Some(claimed) = self.client.claim_next(&self.queue, wait_seconds).await? else {
            return Ok(None);
        };

        let message = &claimed.message;
        Ok(Some(Delivery::new(
            message.id.clone(),
            message.routing_key.clone(),
            message.body.clone().into_bytes(),
            message.attempts > 0,
            Box::new(RedisAcker {
                client: self.client.clone(),
                queue: self.queue.clone(),
                claimed,
            }),
        )))
    }
}

struct RedisAcker {
    client: RedisClient,
    queue: String,
    claimed: ClaimedMessage,
}

#[async_trait]
impl Acknowledger for RedisAcker {
    async fn ack(&self) -> Result<()> {
        self.client.acknowledge(&self.queue, &self.claimed).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        if requeue {
            self.client.requeue(&self.queue, &self.claimed).await?;
        } else {
            warn!(
                "Dead-lettering message {} ({}) on {}",
                self.claimed.message.id, self.claimed.message.routing_key, self.queue
            );
            self.client.dead_letter(&self.queue, &self.claimed).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_bus() -> Option<RedisBus> {
        let url = std::env::var("REDIS_URL").ok()?;
        RedisBus::connect(&url).await.ok()
    }

    #[tokio::test]
    async fn test_redis_publish_and_ack() {
        let Some(bus) = test_bus().await else {
            println!("REDIS_URL not set, skipping");
            return;
        };
        let queue = format!("test-{}", uuid_suffix());
        let key = format!("{}.ping", queue);
        let mut sub = bus.subscribe(&queue, &key).await.unwrap();

        bus.publish(&key, b"{\"ok\":true}".to_vec()).await.unwrap();

        let delivery = sub.next_delivery(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(delivery.routing_key, key);
        assert!(!delivery.redelivered);
        delivery.nack(true).await.unwrap();

        let again = sub.next_delivery(Duration::from_secs(2)).await.unwrap().unwrap();
        assert!(again.redelivered);
        again.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_redis_publish_rejects_non_utf8() {
        let Some(bus) = test_bus().await else {
            return;
        };
        let result = bus.publish("any.key", vec![0xff, 0xfe]).await;
        assert!(matches!(result, Err(BusError::InvalidBody)));
    }

    fn uuid_suffix() -> String {
        format!(
            "{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default()
        )
    }
}
