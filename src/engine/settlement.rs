use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::bus::{EventPublisher, customer_topic, driver_topic, order_topic};
use crate::engine::chat::{ChatEngine, PostMessage};
use crate::engine::location::LocationEngine;
use crate::error::AppError;
use crate::models::chat::{ChatRole, MessageKind};
use crate::models::driver::{Driver, DriverStatus};
use crate::models::event::{BusEvent, StatusUpdate, TransactionUpdate};
use crate::models::order::{Order, OrderStatus};
use crate::models::wallet::{LedgerReason, WalletLedgerEntry};
use crate::observability::metrics::Metrics;
use crate::store::{SettlementResult, Store};

#[derive(Debug, Serialize)]
pub struct CompletionOutcome {
    pub order: Order,
    pub ledger_entry: Option<WalletLedgerEntry>,
    pub duplicate: bool,
}

pub struct SettlementEngine {
    store: Arc<dyn Store>,
    publisher: Arc<EventPublisher>,
    chat: Arc<ChatEngine>,
    location: Arc<LocationEngine>,
    drivers: Arc<DashMap<Uuid, Driver>>,
    commission_fee: Decimal,
    require_proof: bool,
    metrics: Metrics,
}

impl SettlementEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Arc<EventPublisher>,
        chat: Arc<ChatEngine>,
        location: Arc<LocationEngine>,
        drivers: Arc<DashMap<Uuid, Driver>>,
        commission_fee: Decimal,
        require_proof: bool,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            publisher,
            chat,
            location,
            drivers,
            commission_fee,
            require_proof,
            metrics,
        }
    }

    pub async fn complete(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        proof_image: Option<String>,
    ) -> Result<CompletionOutcome, AppError> {
        if self.require_proof && proof_image.is_none() {
            return Err(AppError::Validation(
                "proof of delivery image is required to complete this order".to_string(),
            ));
        }

        let now = Utc::now();
        let result = match self
            .store
            .settle_completion(order_id, driver_id, self.commission_fee, now)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                if matches!(err, AppError::InsufficientBalance { .. }) {
                    self.metrics
                        .settlements_total
                        .with_label_values(&["insufficient_balance"])
                        .inc();
                }
                return Err(err);
            }
        };

        match result {
            SettlementResult::AlreadyCompleted(order) => {
                // Duplicate delivery of the same call; the first one already
                // debited and published.
                self.metrics
                    .settlements_total
                    .with_label_values(&["duplicate"])
                    .inc();
                Ok(CompletionOutcome {
                    order,
                    ledger_entry: None,
                    duplicate: true,
                })
            }
            SettlementResult::Applied { order, entry } => {
                self.metrics
                    .settlements_total
                    .with_label_values(&["completed"])
                    .inc();
                self.metrics
                    .status_transitions_total
                    .with_label_values(&["completed"])
                    .inc();

                if let Some(mut driver) = self.drivers.get_mut(&driver_id) {
                    driver.status = DriverStatus::Available;
                    driver.updated_at = now;
                }
                self.location.clear_driver(driver_id);

                self.publisher
                    .publish_all(
                        &[
                            order_topic(order_id),
                            customer_topic(order.customer_id),
                            driver_topic(driver_id),
                        ],
                        BusEvent::StatusUpdate(StatusUpdate {
                            order_id,
                            status: OrderStatus::Completed,
                            driver_id: Some(driver_id),
                            at: now,
                        }),
                    )
                    .await?;
                self.publisher
                    .publish(
                        &driver_topic(driver_id),
                        BusEvent::TransactionUpdate(TransactionUpdate {
                            driver_id,
                            entry: entry.clone(),
                        }),
                    )
                    .await?;

                self.chat
                    .post(
                        order_id,
                        PostMessage {
                            sender_role: ChatRole::System,
                            sender_id: None,
                            kind: MessageKind::StatusUpdate,
                            content: "Delivery completed".to_string(),
                            image_ref: proof_image,
                            location: None,
                        },
                    )
                    .await?;

                info!(
                    order_id = %order_id,
                    driver_id = %driver_id,
                    fee = %self.commission_fee,
                    "order completed and commission settled"
                );
                Ok(CompletionOutcome {
                    order,
                    ledger_entry: Some(entry),
                    duplicate: false,
                })
            }
        }
    }

    pub async fn top_up(
        &self,
        driver_id: Uuid,
        amount: Decimal,
    ) -> Result<WalletLedgerEntry, AppError> {
        if amount <= Decimal::ZERO {
            return Err(AppError::Validation(
                "top-up amount must be positive".to_string(),
            ));
        }
        if !self.drivers.contains_key(&driver_id) {
            return Err(AppError::NotFound(format!("driver {driver_id} not found")));
        }

        let entry = self
            .store
            .append_ledger(driver_id, amount, LedgerReason::Topup, None)
            .await?;
        self.publisher
            .publish(
                &driver_topic(driver_id),
                BusEvent::TransactionUpdate(TransactionUpdate {
                    driver_id,
                    entry: entry.clone(),
                }),
            )
            .await?;

        info!(driver_id = %driver_id, amount = %amount, "wallet topped up");
        Ok(entry)
    }

    pub async fn balance(&self, driver_id: Uuid) -> Result<Decimal, AppError> {
        self.store.wallet_balance(driver_id).await
    }

    pub async fn ledger(&self, driver_id: Uuid) -> Result<Vec<WalletLedgerEntry>, AppError> {
        self.store.ledger(driver_id).await
    }
}
