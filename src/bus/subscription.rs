use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::error::AppError;
use crate::models::event::BusEvent;
use crate::observability::metrics::Metrics;

/// Topic subscriptions held by one actor session. All forwarders are
/// cancelled together on teardown, so a closed session can never leak a
/// listener.
pub struct SessionSubscriptions {
    bus: Arc<dyn EventBus>,
    out_tx: mpsc::Sender<BusEvent>,
    topics: Mutex<HashMap<String, CancellationToken>>,
    cancel: CancellationToken,
    metrics: Metrics,
}

impl SessionSubscriptions {
    pub fn new(bus: Arc<dyn EventBus>, out_tx: mpsc::Sender<BusEvent>, metrics: Metrics) -> Self {
        Self {
            bus,
            out_tx,
            topics: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            metrics,
        }
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), AppError> {
        let mut topics = self.topics.lock().await;
        if topics.contains_key(topic) {
            return Ok(());
        }

        let rx = self.bus.subscribe(topic).await?;
        let token = self.cancel.child_token();
        topics.insert(topic.to_string(), token.clone());
        drop(topics);

        self.metrics.active_subscriptions.inc();
        let out_tx = self.out_tx.clone();
        let metrics = self.metrics.clone();
        let topic = topic.to_string();

        tokio::spawn(async move {
            let mut stream = BroadcastStream::new(rx);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok(event)) => {
                            if out_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                            warn!(topic, skipped, "subscriber lagged behind topic");
                        }
                        None => break,
                    },
                }
            }
            metrics.active_subscriptions.dec();
            debug!(topic, "topic forwarder stopped");
        });

        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) {
        if let Some(token) = self.topics.lock().await.remove(topic) {
            token.cancel();
        }
    }

    /// Diff-based reconcile: only the topics entering or leaving the desired
    /// set are touched, so retained topics keep receiving without a gap.
    pub async fn reconcile(&self, desired: &HashSet<String>) -> Result<(), AppError> {
        let current: HashSet<String> = self.topics.lock().await.keys().cloned().collect();

        for topic in current.difference(desired) {
            self.unsubscribe(topic).await;
        }
        for topic in desired.difference(&current) {
            self.subscribe(topic).await?;
        }
        Ok(())
    }

    pub async fn teardown(&self) {
        self.cancel.cancel();
        self.topics.lock().await.clear();
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.lock().await.len()
    }
}

impl Drop for SessionSubscriptions {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::SessionSubscriptions;
    use crate::bus::{EventBus, InProcessBus};
    use crate::models::event::{BusEvent, StatusUpdate};
    use crate::models::order::OrderStatus;
    use crate::observability::metrics::Metrics;

    fn status_event(order: u128) -> BusEvent {
        BusEvent::StatusUpdate(StatusUpdate {
            order_id: Uuid::from_u128(order),
            status: OrderStatus::Pending,
            driver_id: None,
            at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let bus = Arc::new(InProcessBus::new(16));
        let (tx, _rx) = mpsc::channel(16);
        let subs = SessionSubscriptions::new(bus.clone(), tx, Metrics::new());

        subs.subscribe("order/a").await.unwrap();
        subs.subscribe("order/a").await.unwrap();

        assert_eq!(subs.topic_count().await, 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bus.subscriber_count("order/a"), 1);
    }

    #[tokio::test]
    async fn subscribed_events_are_forwarded() {
        let bus = Arc::new(InProcessBus::new(16));
        let (tx, mut rx) = mpsc::channel(16);
        let subs = SessionSubscriptions::new(bus.clone(), tx, Metrics::new());

        subs.subscribe("order/a").await.unwrap();
        bus.publish("order/a", status_event(1)).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, BusEvent::StatusUpdate(_)));
    }

    #[tokio::test]
    async fn reconcile_diffs_against_current_set() {
        let bus = Arc::new(InProcessBus::new(16));
        let (tx, _rx) = mpsc::channel(64);
        let subs = SessionSubscriptions::new(bus.clone(), tx, Metrics::new());

        subs.subscribe("order/a").await.unwrap();
        subs.subscribe("order/b").await.unwrap();

        let desired: HashSet<String> = ["order/b", "order/c"]
            .into_iter()
            .map(String::from)
            .collect();
        subs.reconcile(&desired).await.unwrap();

        assert_eq!(subs.topic_count().await, 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.subscriber_count("order/a"), 0);
        assert_eq!(bus.subscriber_count("order/b"), 1);
        assert_eq!(bus.subscriber_count("order/c"), 1);
    }

    #[tokio::test]
    async fn teardown_drops_every_listener() {
        let bus = Arc::new(InProcessBus::new(16));
        let (tx, _rx) = mpsc::channel(64);
        let subs = SessionSubscriptions::new(bus.clone(), tx, Metrics::new());

        for topic in ["order/a", "order/b", "driver/c"] {
            subs.subscribe(topic).await.unwrap();
        }
        subs.teardown().await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(subs.topic_count().await, 0);
        assert_eq!(bus.subscriber_count("order/a"), 0);
        assert_eq!(bus.subscriber_count("order/b"), 0);
        assert_eq!(bus.subscriber_count("driver/c"), 0);
    }
}
