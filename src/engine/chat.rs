use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::bus::{EventPublisher, customer_topic, driver_topic, order_topic};
use crate::error::AppError;
use crate::geo::GeoPoint;
use crate::models::chat::{ChatMessage, ChatRole, ChatSender, MessageKind};
use crate::models::event::BusEvent;
use crate::models::order::Order;
use crate::observability::metrics::Metrics;
use crate::store::Store;

#[derive(Debug, Clone, Deserialize)]
pub struct PostMessage {
    pub sender_role: ChatRole,
    pub sender_id: Option<Uuid>,
    pub kind: MessageKind,
    pub content: String,
    pub image_ref: Option<String>,
    pub location: Option<GeoPoint>,
}

pub struct ChatEngine {
    store: Arc<dyn Store>,
    publisher: Arc<EventPublisher>,
    metrics: Metrics,
}

impl ChatEngine {
    pub fn new(store: Arc<dyn Store>, publisher: Arc<EventPublisher>, metrics: Metrics) -> Self {
        Self {
            store,
            publisher,
            metrics,
        }
    }

    pub async fn post(&self, order_id: Uuid, req: PostMessage) -> Result<ChatMessage, AppError> {
        let order = self.store.order(order_id).await?;
        let sender = self.authorize(&order, &req)?;

        if req.kind == MessageKind::Image && req.image_ref.is_none() {
            return Err(AppError::Validation(
                "image messages need an image reference".to_string(),
            ));
        }
        if req.kind == MessageKind::Location && req.location.is_none() {
            return Err(AppError::Validation(
                "location messages need coordinates".to_string(),
            ));
        }
        if req.kind == MessageKind::Text && req.content.trim().is_empty() {
            return Err(AppError::Validation("message cannot be empty".to_string()));
        }

        let message = ChatMessage {
            id: Uuid::new_v4(),
            order_id,
            sender,
            kind: req.kind,
            content: req.content,
            image_ref: req.image_ref,
            location: req.location,
            read: false,
            created_at: Utc::now(),
        };

        // Persist before publish, so a history fetch racing the live event
        // always finds the message.
        self.store.append_chat(message.clone()).await?;
        self.metrics.chat_messages_total.inc();

        let event = BusEvent::ChatMessage(message.clone());
        self.publisher.publish(&order_topic(order_id), event.clone()).await?;
        for topic in self.notify_topics(&order, &message.sender) {
            self.publisher.publish(&topic, event.clone()).await?;
        }

        info!(order_id = %order_id, message_id = %message.id, "chat message posted");
        Ok(message)
    }

    pub async fn mark_read(
        &self,
        order_id: Uuid,
        message_id: Uuid,
        _reader: ChatRole,
    ) -> Result<bool, AppError> {
        self.store.mark_read(order_id, message_id).await
    }

    pub async fn history(&self, order_id: Uuid) -> Result<Vec<ChatMessage>, AppError> {
        self.store.order(order_id).await?;
        self.store.chat_history(order_id).await
    }

    fn authorize(&self, order: &Order, req: &PostMessage) -> Result<ChatSender, AppError> {
        match req.sender_role {
            ChatRole::Customer => {
                if req.sender_id != Some(order.customer_id) {
                    return Err(AppError::Validation(
                        "sender is not this order's customer".to_string(),
                    ));
                }
                Ok(ChatSender::customer(order.customer_id))
            }
            ChatRole::Driver => {
                let driver_id = order.driver_id.ok_or_else(|| {
                    AppError::Validation("order has no assigned driver yet".to_string())
                })?;
                if req.sender_id != Some(driver_id) {
                    return Err(AppError::Validation(
                        "sender is not this order's driver".to_string(),
                    ));
                }
                Ok(ChatSender::driver(driver_id))
            }
            ChatRole::System => Ok(ChatSender::system()),
        }
    }

    /// Out-of-view notification goes to the counterparty; system narration
    /// reaches both humans.
    fn notify_topics(&self, order: &Order, sender: &ChatSender) -> Vec<String> {
        match sender.role {
            ChatRole::Customer => order.driver_id.map(driver_topic).into_iter().collect(),
            ChatRole::Driver => vec![customer_topic(order.customer_id)],
            ChatRole::System => {
                let mut topics = vec![customer_topic(order.customer_id)];
                topics.extend(order.driver_id.map(driver_topic));
                topics
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub message: ChatMessage,
    pub speculative: bool,
}

/// Subscriber-side view of one order's channel. History fetches and live
/// events race on channel open; entries are deduplicated by message identity
/// so each message renders at most once. Locally echoed messages are tagged
/// speculative and swapped for the authoritative copy when it arrives.
#[derive(Default)]
pub struct ChatTimeline {
    entries: Vec<TimelineEntry>,
    seen: HashSet<Uuid>,
}

impl ChatTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_history(&mut self, history: Vec<ChatMessage>) {
        for message in history {
            self.apply_confirmed(message);
        }
    }

    pub fn apply_confirmed(&mut self, message: ChatMessage) {
        if self.seen.contains(&message.id) {
            // Same message via both paths; keep the freshest read flag.
            if message.read
                && let Some(entry) = self.entries.iter_mut().find(|e| e.message.id == message.id)
            {
                entry.message.read = true;
            }
            return;
        }

        // Reconcile a speculative echo: authoritative copy wins.
        if let Some(index) = self
            .entries
            .iter()
            .position(|e| e.speculative && e.message.same_payload(&message))
        {
            self.seen.remove(&self.entries[index].message.id);
            self.seen.insert(message.id);
            self.entries[index] = TimelineEntry {
                message,
                speculative: false,
            };
            return;
        }

        self.seen.insert(message.id);
        let at = self
            .entries
            .partition_point(|e| e.message.created_at <= message.created_at);
        self.entries.insert(
            at,
            TimelineEntry {
                message,
                speculative: false,
            },
        );
    }

    pub fn add_speculative(&mut self, message: ChatMessage) {
        if self.seen.insert(message.id) {
            self.entries.push(TimelineEntry {
                message,
                speculative: true,
            });
        }
    }

    pub fn rendered(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{ChatTimeline, TimelineEntry};
    use crate::models::chat::{ChatMessage, ChatSender, MessageKind};

    fn message(id: u128, content: &str) -> ChatMessage {
        ChatMessage {
            id: Uuid::from_u128(id),
            order_id: Uuid::from_u128(1),
            sender: ChatSender::customer(Uuid::from_u128(2)),
            kind: MessageKind::Text,
            content: content.to_string(),
            image_ref: None,
            location: None,
            read: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn history_and_live_copies_render_once() {
        let mut timeline = ChatTimeline::new();
        let msg = message(10, "on my way");

        timeline.apply_history(vec![msg.clone()]);
        timeline.apply_confirmed(msg);

        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn live_event_before_history_fetch_still_renders_once() {
        let mut timeline = ChatTimeline::new();
        let msg = message(10, "on my way");

        timeline.apply_confirmed(msg.clone());
        timeline.apply_history(vec![msg]);

        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn speculative_echo_is_replaced_by_authoritative_copy() {
        let mut timeline = ChatTimeline::new();

        let mut local = message(99, "see you soon");
        local.id = Uuid::from_u128(99);
        timeline.add_speculative(local);

        let mut confirmed = message(10, "see you soon");
        confirmed.read = false;
        timeline.apply_confirmed(confirmed);

        assert_eq!(timeline.len(), 1);
        let entry: &TimelineEntry = &timeline.rendered()[0];
        assert!(!entry.speculative);
        assert_eq!(entry.message.id, Uuid::from_u128(10));
    }

    #[test]
    fn distinct_messages_are_kept_in_created_order() {
        let mut timeline = ChatTimeline::new();
        let first = message(1, "a");
        let mut second = message(2, "b");
        second.created_at = first.created_at + chrono::Duration::seconds(1);

        timeline.apply_confirmed(second.clone());
        timeline.apply_confirmed(first.clone());

        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.rendered()[0].message.id, first.id);
        assert_eq!(timeline.rendered()[1].message.id, second.id);
    }
}
