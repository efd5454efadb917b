use message_bus::{Delivery, MessageBus};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use wallet_core::decode_message;

use crate::Result;

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Consume `queue` until `shutdown` flips to true. Every delivery is
/// decoded and handed to `handler`; it is acked on success and nacked
/// without requeue when decoding or handling fails.
pub(crate) async fn consume<T, F, Fut>(
    bus: Arc<dyn MessageBus>,
    queue: &str,
    pattern: &str,
    poll_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    handler: F,
) -> Result<()>
where
    T: DeserializeOwned,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut subscription = bus.subscribe(queue, pattern).await?;
    info!("Consuming {} ({})", queue, pattern);

    // Checked between polls so an in-flight receive is never cancelled
    while !*shutdown.borrow() {
        let delivery = match subscription.next_delivery(poll_timeout).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                error!("Receive from {} failed: {}", queue, e);
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                continue;
            }
        };
        settle(delivery, &handler).await;
    }

    info!("Consumer for {} stopped", queue);
    Ok(())
}

async fn settle<T, F, Fut>(delivery: Delivery, handler: &F)
where
    T: DeserializeOwned,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let outcome = match decode_message::<T>(&delivery.body) {
        Ok(message) => handler(message).await,
        Err(e) => Err(e.into()),
    };

    match outcome {
        Ok(()) => {
            debug!("Acking {} ({})", delivery.delivery_id, delivery.routing_key);
            if let Err(e) = delivery.ack().await {
                warn!("Ack failed: {}", e);
            }
        }
        Err(e) => {
            error!(
                "Handler failed for delivery {} on {} (redelivered: {}): {} - nacking without requeue",
                delivery.delivery_id, delivery.routing_key, delivery.redelivered, e
            );
            if let Err(e) = delivery.nack(false).await {
                warn!("Nack failed: {}", e);
            }
        }
    }
}
