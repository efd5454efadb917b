use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const BINDINGS_KEY: &str = "bus:bindings";

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Redis health status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisHealthStatus {
    pub connected: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// A message as stored in a Redis-backed queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub routing_key: String,
    pub body: String,
    /// Number of times the message was handed back to the queue
    pub attempts: u32,
}

impl QueuedMessage {
    pub fn new(routing_key: &str, body: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            routing_key: routing_key.to_string(),
            body,
            attempts: 0,
        }
    }
}

/// A message moved into a consumer's processing list; `raw` is the exact
/// stored string and is needed to remove it on ack
#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    pub message: QueuedMessage,
    pub raw: String,
}

fn queue_key(queue: &str) -> String {
    format!("bus:queue:{}", queue)
}

fn processing_key(queue: &str) -> String {
    format!("bus:processing:{}", queue)
}

fn dead_letter_key(queue: &str) -> String {
    format!("bus:dead:{}", queue)
}

#[derive(Debug, Clone)]
pub struct RedisClient {
    client: Client,
}

impl RedisClient {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Test the connection
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self { client })
    }

    async fn get_connection(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(PersistenceError::from)
    }

    // =====================================
    // Queue Bindings
    // =====================================

    /// Bind a queue to a routing pattern
    pub async fn bind_queue(&self, queue: &str, pattern: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = conn.hset(BINDINGS_KEY, queue, pattern).await?;
        debug!("Bound queue {} to pattern {}", queue, pattern);
        Ok(())
    }

    /// All queue -> pattern bindings
    pub async fn get_bindings(&self) -> Result<HashMap<String, String>> {
        let mut conn = self.get_connection().await?;
        let bindings: HashMap<String, String> = conn.hgetall(BINDINGS_KEY).await?;
        Ok(bindings)
    }

    // =====================================
    // Reliable Queue Operations
    // =====================================

    /// Push one message into every listed queue atomically.
    /// Returns once Redis has acknowledged the write.
    pub async fn push_to_queues(&self, queues: &[String], message: &QueuedMessage) -> Result<()> {
        if queues.is_empty() {
            return Ok(());
        }

        let raw = serde_json::to_string(message)?;
        let mut conn = self.get_connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for queue in queues {
            pipe.lpush(queue_key(queue), &raw).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;

        debug!(
            "Pushed message {} ({}) to {} queue(s)",
            message.id,
            message.routing_key,
            queues.len()
        );
        Ok(())
    }

    /// Block up to `timeout_seconds` for the next message, moving it into the
    /// queue's processing list until it is acknowledged
    pub async fn claim_next(&self, queue: &str, timeout_seconds: u64) -> Result<Option<ClaimedMessage>> {
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(queue_key(queue))
            .arg(processing_key(queue))
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout_seconds as f64)
            .query_async(&mut conn)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<QueuedMessage>(&raw) {
            Ok(message) => Ok(Some(ClaimedMessage { message, raw })),
            Err(e) => {
                warn!("Dropping undecodable entry from queue {}: {}", queue, e);
                let _: () = redis::pipe()
                    .atomic()
                    .lrem(processing_key(queue), 1, &raw)
                    .ignore()
                    .lpush(dead_letter_key(queue), &raw)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Remove an acknowledged message from the processing list
    pub async fn acknowledge(&self, queue: &str, claimed: &ClaimedMessage) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let removed: i64 = conn.lrem(processing_key(queue), 1, &claimed.raw).await?;
        if removed == 0 {
            warn!(
                "Acknowledged message {} was not in processing list of {}",
                claimed.message.id, queue
            );
        }
        Ok(())
    }

    /// Hand a message back to its queue so it is delivered next
    pub async fn requeue(&self, queue: &str, claimed: &ClaimedMessage) -> Result<()> {
        let mut message = claimed.message.clone();
        message.attempts += 1;
        let raw = serde_json::to_string(&message)?;
        let mut conn = self.get_connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .lrem(processing_key(queue), 1, &claimed.raw)
            .ignore()
            .rpush(queue_key(queue), &raw)
            .ignore()
            .query_async(&mut conn)
            .await?;
        debug!("Requeued message {} on {}", message.id, queue);
        Ok(())
    }

    /// Move a rejected message to the queue's dead-letter list
    pub async fn dead_letter(&self, queue: &str, claimed: &ClaimedMessage) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .lrem(processing_key(queue), 1, &claimed.raw)
            .ignore()
            .lpush(dead_letter_key(queue), &claimed.raw)
            .ignore()
            .query_async(&mut conn)
            .await?;
        warn!("Dead-lettered message {} from {}", claimed.message.id, queue);
        Ok(())
    }

    /// Return messages left in the processing list by a crashed consumer to
    /// the queue. Call before starting consumers.
    pub async fn recover_in_flight(&self, queue: &str) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let mut recovered = 0u64;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(processing_key(queue))
                .arg(queue_key(queue))
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!("Recovered {} in-flight message(s) on {}", recovered, queue);
        }
        Ok(recovered)
    }

    /// Get the current size of a queue
    pub async fn get_queue_size(&self, queue: &str) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let size: u64 = conn.llen(queue_key(queue)).await?;
        Ok(size)
    }

    /// Get the current size of a queue's dead-letter list
    pub async fn get_dead_letter_size(&self, queue: &str) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let size: u64 = conn.llen(dead_letter_key(queue)).await?;
        Ok(size)
    }

    // =====================================
    // Key/Value Cache
    // =====================================

    /// Get cached data (generic Redis GET)
    pub async fn get_cached_data(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_connection().await?;
        let result: Option<String> = conn.get(key).await?;
        Ok(result)
    }

    /// Set data with expiry (Redis SET with EX)
    pub async fn set_with_expiry(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = conn.set_ex(key, value, ttl_seconds).await?;
        Ok(())
    }

    // =====================================
    // Health Checks and Connectivity
    // =====================================

    /// Test Redis connectivity and health
    pub async fn health_check(&self) -> RedisHealthStatus {
        let start_time = std::time::Instant::now();

        match self.ping().await {
            Ok(pong) if pong == "PONG" => RedisHealthStatus {
                connected: true,
                latency_ms: start_time.elapsed().as_millis() as u64,
                error: None,
            },
            Ok(other) => RedisHealthStatus {
                connected: false,
                latency_ms: start_time.elapsed().as_millis() as u64,
                error: Some(format!("Unexpected PING reply: {}", other)),
            },
            Err(e) => RedisHealthStatus {
                connected: false,
                latency_ms: start_time.elapsed().as_millis() as u64,
                error: Some(format!("Connection failed: {}", e)),
            },
        }
    }

    /// Test Redis connection
    pub async fn ping(&self) -> Result<String> {
        let mut conn = self.get_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_client() -> Option<RedisClient> {
        // These tests require a running Redis instance
        // Skip if REDIS_URL is not set
        let redis_url = std::env::var("REDIS_URL").ok()?;
        Some(RedisClient::new(&redis_url).await.unwrap())
    }

    #[tokio::test]
    async fn test_redis_connection() {
        let Some(client) = test_client().await else {
            return;
        };
        let result = client.ping().await.unwrap();
        assert_eq!(result, "PONG");
        assert!(client.health_check().await.connected);
    }

    #[tokio::test]
    async fn test_queue_claim_ack_cycle() {
        let Some(client) = test_client().await else {
            return;
        };
        let queue = format!("test-{}", Uuid::new_v4());
        let message = QueuedMessage::new("integration.result.moralis-tokens", "{}".to_string());
        client.push_to_queues(&[queue.clone()], &message).await.unwrap();

        let claimed = client.claim_next(&queue, 1).await.unwrap().unwrap();
        assert_eq!(claimed.message, message);
        client.requeue(&queue, &claimed).await.unwrap();

        let again = client.claim_next(&queue, 1).await.unwrap().unwrap();
        assert_eq!(again.message.attempts, 1);
        client.acknowledge(&queue, &again).await.unwrap();
        assert_eq!(client.get_queue_size(&queue).await.unwrap(), 0);
    }

    #[test]
    fn test_queued_message_round_trips_through_json() {
        let message = QueuedMessage::new("aggregation.requested", "{\"a\":1}".to_string());
        let raw = serde_json::to_string(&message).unwrap();
        let decoded: QueuedMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded, message);
    }
}
