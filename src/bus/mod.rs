pub mod subscription;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::event::BusEvent;
use crate::observability::metrics::Metrics;

pub fn order_topic(order_id: Uuid) -> String {
    format!("order/{order_id}")
}

pub fn driver_topic(driver_id: Uuid) -> String {
    format!("driver/{driver_id}")
}

pub fn customer_topic(customer_id: Uuid) -> String {
    format!("customer/{customer_id}")
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<BusEvent>, AppError>;

    /// Delivers the event to current subscribers of the topic. Returns the
    /// number of receivers the event reached; zero is not an error.
    async fn publish(&self, topic: &str, event: BusEvent) -> Result<usize, AppError>;
}

pub struct InProcessBus {
    topics: DashMap<String, broadcast::Sender<BusEvent>>,
    capacity: usize,
}

impl InProcessBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity,
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusEvent> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<BusEvent>, AppError> {
        Ok(self.sender(topic).subscribe())
    }

    async fn publish(&self, topic: &str, event: BusEvent) -> Result<usize, AppError> {
        // A send error only means nobody is listening right now.
        Ok(self.sender(topic).send(event).unwrap_or(0))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(8))
    }
}

/// Publisher shared by the engines: bounded exponential backoff on channel
/// failure, then the error surfaces to the caller.
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>, retry: RetryPolicy, metrics: Metrics) -> Self {
        Self { bus, retry, metrics }
    }

    pub fn bus(&self) -> Arc<dyn EventBus> {
        self.bus.clone()
    }

    pub async fn publish(&self, topic: &str, event: BusEvent) -> Result<(), AppError> {
        let mut attempt = 0;
        loop {
            match self.bus.publish(topic, event.clone()).await {
                Ok(_) => return Ok(()),
                Err(err) if attempt + 1 < self.retry.attempts => {
                    self.metrics.bus_publish_retries_total.inc();
                    warn!(topic, attempt, error = %err, "publish failed; backing off");
                    tokio::time::sleep(self.retry.backoff_delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fan-out in declaration order; the order topic is expected first so
    /// per-topic FIFO holds for subscribers of that topic.
    pub async fn publish_all(&self, topics: &[String], event: BusEvent) -> Result<(), AppError> {
        for topic in topics {
            self.publish(topic, event.clone()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    use super::{EventBus, EventPublisher, InProcessBus, RetryPolicy};
    use crate::error::AppError;
    use crate::models::event::{BusEvent, StatusUpdate};
    use crate::models::order::OrderStatus;
    use crate::observability::metrics::Metrics;

    struct FlakyBus {
        failures: AtomicU32,
        inner: InProcessBus,
    }

    #[async_trait]
    impl EventBus for FlakyBus {
        async fn subscribe(
            &self,
            topic: &str,
        ) -> Result<broadcast::Receiver<BusEvent>, AppError> {
            self.inner.subscribe(topic).await
        }

        async fn publish(&self, topic: &str, event: BusEvent) -> Result<usize, AppError> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            })
            .is_ok()
            {
                return Err(AppError::Channel("bus unavailable".to_string()));
            }
            self.inner.publish(topic, event).await
        }
    }

    fn status_event() -> BusEvent {
        BusEvent::StatusUpdate(StatusUpdate {
            order_id: Uuid::from_u128(1),
            status: OrderStatus::Pending,
            driver_id: None,
            at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn publish_retries_through_transient_failures() {
        let bus = Arc::new(FlakyBus {
            failures: AtomicU32::new(2),
            inner: InProcessBus::new(16),
        });
        let mut rx = bus.subscribe("order/x").await.unwrap();

        let publisher = EventPublisher::new(
            bus.clone(),
            RetryPolicy::new(4, Duration::from_millis(1)),
            Metrics::new(),
        );

        publisher.publish("order/x", status_event()).await.unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn publish_surfaces_channel_error_after_bounded_retries() {
        let bus = Arc::new(FlakyBus {
            failures: AtomicU32::new(10),
            inner: InProcessBus::new(16),
        });
        let publisher = EventPublisher::new(
            bus,
            RetryPolicy::new(3, Duration::from_millis(1)),
            Metrics::new(),
        );

        let err = publisher.publish("order/x", status_event()).await.unwrap_err();
        assert!(matches!(err, AppError::Channel(_)));
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy::new(5, Duration::from_millis(50));
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(50));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
    }
}
