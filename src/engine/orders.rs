use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{EventPublisher, customer_topic, driver_topic, order_topic};
use crate::engine::location::LocationEngine;
use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::driver::{Driver, DriverStatus};
use crate::models::event::{BusEvent, BookingUpdate, StatusUpdate};
use crate::models::order::{Address, Order, OrderStatus};
use crate::observability::metrics::Metrics;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RespondDecision {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProposeRequest {
    pub customer_id: Uuid,
    pub pickup: Address,
    pub dropoff: Address,
    pub fare: Decimal,
    pub package_description: Option<String>,
    pub recipient_phone: Option<String>,
}

#[derive(Clone)]
pub struct OrderEngine {
    store: Arc<dyn Store>,
    publisher: Arc<EventPublisher>,
    drivers: Arc<DashMap<Uuid, Driver>>,
    location: Arc<LocationEngine>,
    metrics: Metrics,
    expiry: Duration,
    expiry_tasks: Arc<DashMap<Uuid, CancellationToken>>,
}

impl OrderEngine {
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Arc<EventPublisher>,
        drivers: Arc<DashMap<Uuid, Driver>>,
        location: Arc<LocationEngine>,
        metrics: Metrics,
        expiry: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            drivers,
            location,
            metrics,
            expiry,
            expiry_tasks: Arc::new(DashMap::new()),
        }
    }

    pub async fn propose(&self, req: ProposeRequest) -> Result<Order, AppError> {
        if req.fare <= Decimal::ZERO {
            return Err(AppError::Validation("fare must be positive".to_string()));
        }
        if !req.pickup.point.is_finite() || !req.dropoff.point.is_finite() {
            return Err(AppError::Validation(
                "pickup and dropoff coordinates must be finite".to_string(),
            ));
        }
        if req.pickup.label.trim().is_empty() || req.dropoff.label.trim().is_empty() {
            return Err(AppError::Validation(
                "pickup and dropoff labels cannot be empty".to_string(),
            ));
        }

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            customer_id: req.customer_id,
            driver_id: None,
            status: OrderStatus::Pending,
            distance_km: haversine_km(&req.pickup.point, &req.dropoff.point),
            pickup: req.pickup,
            dropoff: req.dropoff,
            fare: req.fare,
            package_description: req.package_description,
            recipient_phone: req.recipient_phone,
            created_at: now,
            expires_at: Some(now + chrono::Duration::from_std(self.expiry).unwrap_or_default()),
            responded_at: None,
            completed_at: None,
        };

        self.store.insert_order(order.clone()).await?;
        self.metrics
            .status_transitions_total
            .with_label_values(&["pending"])
            .inc();

        let update = BusEvent::StatusUpdate(StatusUpdate {
            order_id: order.id,
            status: OrderStatus::Pending,
            driver_id: None,
            at: now,
        });
        self.publisher
            .publish_all(
                &[order_topic(order.id), customer_topic(order.customer_id)],
                update.clone(),
            )
            .await?;

        // Offer fan-out to every driver currently able to take work.
        let available: Vec<Uuid> = self
            .drivers
            .iter()
            .filter(|d| d.value().status == DriverStatus::Available)
            .map(|d| d.value().id)
            .collect();
        for driver_id in available {
            self.publisher
                .publish(&driver_topic(driver_id), update.clone())
                .await?;
        }

        self.spawn_expiry(order.id);
        info!(order_id = %order.id, customer_id = %order.customer_id, "order proposed");
        Ok(order)
    }

    fn spawn_expiry(&self, order_id: Uuid) {
        let token = CancellationToken::new();
        self.expiry_tasks.insert(order_id, token.clone());

        let engine = self.clone();
        let deadline = self.expiry;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    if let Err(err) = engine.expire(order_id).await {
                        warn!(order_id = %order_id, error = %err, "expiry sweep failed");
                    }
                }
            }
            engine.expiry_tasks.remove(&order_id);
        });
    }

    fn cancel_expiry(&self, order_id: Uuid) {
        if let Some((_, token)) = self.expiry_tasks.remove(&order_id) {
            token.cancel();
        }
    }

    pub async fn respond(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        decision: RespondDecision,
    ) -> Result<Order, AppError> {
        if !self.drivers.contains_key(&driver_id) {
            return Err(AppError::NotFound(format!("driver {driver_id} not found")));
        }

        match decision {
            RespondDecision::Accept => self.accept(order_id, driver_id).await,
            RespondDecision::Reject => self.reject(order_id, driver_id).await,
        }
    }

    async fn accept(&self, order_id: Uuid, driver_id: Uuid) -> Result<Order, AppError> {
        let now = Utc::now();
        let order = match self
            .store
            .bind_driver_if_pending(order_id, driver_id, now)
            .await
        {
            Ok(order) => order,
            Err(err) => {
                if matches!(err, AppError::Conflict(_)) {
                    self.metrics
                        .respond_outcomes_total
                        .with_label_values(&["conflict"])
                        .inc();
                }
                return Err(err);
            }
        };

        self.cancel_expiry(order_id);
        if let Some(mut driver) = self.drivers.get_mut(&driver_id) {
            driver.status = DriverStatus::Delivering;
            driver.updated_at = now;
        }

        self.metrics
            .respond_outcomes_total
            .with_label_values(&["accepted"])
            .inc();
        self.metrics
            .status_transitions_total
            .with_label_values(&["accepted"])
            .inc();

        let update = BusEvent::StatusUpdate(StatusUpdate {
            order_id,
            status: OrderStatus::Accepted,
            driver_id: Some(driver_id),
            at: now,
        });
        self.publisher
            .publish_all(
                &[
                    order_topic(order_id),
                    customer_topic(order.customer_id),
                    driver_topic(driver_id),
                ],
                update,
            )
            .await?;
        self.publisher
            .publish(
                &driver_topic(driver_id),
                BusEvent::BookingAccepted(BookingUpdate {
                    order_id,
                    driver_id,
                    at: now,
                }),
            )
            .await?;

        info!(order_id = %order_id, driver_id = %driver_id, "order accepted");
        Ok(order)
    }

    async fn reject(&self, order_id: Uuid, driver_id: Uuid) -> Result<Order, AppError> {
        let now = Utc::now();
        let order = self.store.record_rejection(order_id, driver_id).await?;

        self.metrics
            .respond_outcomes_total
            .with_label_values(&["rejected"])
            .inc();
        self.publisher
            .publish(
                &driver_topic(driver_id),
                BusEvent::BookingRejected(BookingUpdate {
                    order_id,
                    driver_id,
                    at: now,
                }),
            )
            .await?;

        // The order stays pending for other drivers; it only goes terminal
        // once nobody eligible is left.
        let rejected = self.store.rejected_drivers(order_id).await?;
        let eligible_remaining = self
            .drivers
            .iter()
            .any(|d| d.value().status == DriverStatus::Available && !rejected.contains(&d.value().id));

        if !eligible_remaining {
            if let Ok(order) = self
                .store
                .transition_status(order_id, OrderStatus::Rejected, now)
                .await
            {
                self.cancel_expiry(order_id);
                self.metrics
                    .status_transitions_total
                    .with_label_values(&["rejected"])
                    .inc();
                self.publisher
                    .publish_all(
                        &[order_topic(order_id), customer_topic(order.customer_id)],
                        BusEvent::StatusUpdate(StatusUpdate {
                            order_id,
                            status: OrderStatus::Rejected,
                            driver_id: None,
                            at: now,
                        }),
                    )
                    .await?;
                info!(order_id = %order_id, "order rejected by all eligible drivers");
                return Ok(order);
            }
        }

        info!(order_id = %order_id, driver_id = %driver_id, "offer rejected");
        Ok(order)
    }

    pub async fn advance(
        &self,
        order_id: Uuid,
        actor_id: Uuid,
        next: OrderStatus,
    ) -> Result<Order, AppError> {
        if !matches!(
            next,
            OrderStatus::PickedUp | OrderStatus::InTransit | OrderStatus::Cancelled
        ) {
            return Err(AppError::Validation(format!(
                "{} is not reachable through advance",
                next.as_str()
            )));
        }

        let current = self.store.order(order_id).await?;
        match next {
            OrderStatus::PickedUp | OrderStatus::InTransit => {
                if current.driver_id != Some(actor_id) {
                    return Err(AppError::Validation(format!(
                        "only the assigned driver may move order {order_id} to {}",
                        next.as_str()
                    )));
                }
            }
            OrderStatus::Cancelled => {
                let is_party =
                    actor_id == current.customer_id || current.driver_id == Some(actor_id);
                if !is_party {
                    return Err(AppError::Validation(format!(
                        "actor {actor_id} is not a party to order {order_id}"
                    )));
                }
            }
            _ => unreachable!(),
        }

        let now = Utc::now();
        let order = self.store.transition_status(order_id, next, now).await?;

        self.metrics
            .status_transitions_total
            .with_label_values(&[next.as_str()])
            .inc();

        let mut topics = vec![order_topic(order_id), customer_topic(order.customer_id)];
        if let Some(driver_id) = order.driver_id {
            topics.push(driver_topic(driver_id));
        }
        self.publisher
            .publish_all(
                &topics,
                BusEvent::StatusUpdate(StatusUpdate {
                    order_id,
                    status: next,
                    driver_id: order.driver_id,
                    at: now,
                }),
            )
            .await?;

        if next == OrderStatus::Cancelled {
            self.cancel_expiry(order_id);
            if let Some(driver_id) = order.driver_id {
                if let Some(mut driver) = self.drivers.get_mut(&driver_id) {
                    driver.status = DriverStatus::Available;
                    driver.updated_at = now;
                }
                self.location.clear_driver(driver_id);
            }
        }

        info!(order_id = %order_id, status = next.as_str(), "order advanced");
        Ok(order)
    }

    pub async fn expire(&self, order_id: Uuid) -> Result<Option<Order>, AppError> {
        let Some(order) = self.store.expire_if_pending(order_id).await? else {
            return Ok(None);
        };

        self.metrics
            .status_transitions_total
            .with_label_values(&["expired"])
            .inc();
        self.publisher
            .publish_all(
                &[order_topic(order_id), customer_topic(order.customer_id)],
                BusEvent::StatusUpdate(StatusUpdate {
                    order_id,
                    status: OrderStatus::Expired,
                    driver_id: None,
                    at: Utc::now(),
                }),
            )
            .await?;

        info!(order_id = %order_id, "order expired");
        Ok(Some(order))
    }
}
