use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use uuid::Uuid;

use std::collections::HashSet;

use crate::error::AppError;
use crate::models::chat::ChatMessage;
use crate::models::order::{Order, OrderStatus};
use crate::models::wallet::{LedgerReason, WalletLedgerEntry};

#[derive(Debug)]
pub enum SettlementResult {
    Applied {
        order: Order,
        entry: WalletLedgerEntry,
    },
    AlreadyCompleted(Order),
}

/// Persistent-store collaborator. The only hard requirement on an
/// implementation is entity-scoped atomicity: the conditional updates below
/// must be check-and-set against the current row, and `settle_completion`
/// must commit the status write and the ledger append as one unit.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_order(&self, order: Order) -> Result<(), AppError>;
    async fn order(&self, order_id: Uuid) -> Result<Order, AppError>;
    async fn order_count(&self) -> usize;
    async fn active_order_for_driver(&self, driver_id: Uuid) -> Result<Option<Order>, AppError>;

    /// First writer wins: succeeds for exactly one driver while the order is
    /// still pending; everyone else gets a conflict.
    async fn bind_driver_if_pending(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Order, AppError>;

    async fn record_rejection(&self, order_id: Uuid, driver_id: Uuid)
    -> Result<Order, AppError>;
    async fn rejected_drivers(&self, order_id: Uuid) -> Result<HashSet<Uuid>, AppError>;

    async fn transition_status(
        &self,
        order_id: Uuid,
        next: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<Order, AppError>;

    /// Idempotent: returns `None` when the order is no longer pending.
    async fn expire_if_pending(&self, order_id: Uuid) -> Result<Option<Order>, AppError>;

    async fn append_chat(&self, message: ChatMessage) -> Result<(), AppError>;
    async fn chat_history(&self, order_id: Uuid) -> Result<Vec<ChatMessage>, AppError>;
    async fn mark_read(&self, order_id: Uuid, message_id: Uuid) -> Result<bool, AppError>;

    async fn wallet_balance(&self, driver_id: Uuid) -> Result<Decimal, AppError>;
    async fn append_ledger(
        &self,
        driver_id: Uuid,
        delta: Decimal,
        reason: LedgerReason,
        order_id: Option<Uuid>,
    ) -> Result<WalletLedgerEntry, AppError>;
    async fn ledger(&self, driver_id: Uuid) -> Result<Vec<WalletLedgerEntry>, AppError>;

    async fn settle_completion(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        commission_fee: Decimal,
        at: DateTime<Utc>,
    ) -> Result<SettlementResult, AppError>;
}

#[derive(Default)]
struct WalletAccount {
    balance: Decimal,
    entries: Vec<WalletLedgerEntry>,
}

impl WalletAccount {
    fn append(
        &mut self,
        driver_id: Uuid,
        delta: Decimal,
        reason: LedgerReason,
        order_id: Option<Uuid>,
    ) -> WalletLedgerEntry {
        self.balance += delta;
        let entry = WalletLedgerEntry {
            id: Uuid::new_v4(),
            driver_id,
            delta,
            reason,
            balance_after: self.balance,
            order_id,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        entry
    }
}

#[derive(Default)]
pub struct MemStore {
    orders: DashMap<Uuid, Order>,
    rejections: DashMap<Uuid, HashSet<Uuid>>,
    chats: DashMap<Uuid, Vec<ChatMessage>>,
    wallets: DashMap<Uuid, WalletAccount>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn insert_order(&self, order: Order) -> Result<(), AppError> {
        if self.orders.contains_key(&order.id) {
            return Err(AppError::Conflict(format!(
                "order {} already exists",
                order.id
            )));
        }
        self.orders.insert(order.id, order);
        Ok(())
    }

    async fn order(&self, order_id: Uuid) -> Result<Order, AppError> {
        self.orders
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
    }

    async fn order_count(&self) -> usize {
        self.orders.len()
    }

    async fn active_order_for_driver(&self, driver_id: Uuid) -> Result<Option<Order>, AppError> {
        Ok(self
            .orders
            .iter()
            .find(|entry| entry.value().driver_id == Some(driver_id) && entry.value().is_active())
            .map(|entry| entry.value().clone()))
    }

    async fn bind_driver_if_pending(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Order, AppError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

        if order.status != OrderStatus::Pending {
            return Err(AppError::Conflict(format!(
                "order {} is no longer pending ({})",
                order_id,
                order.status.as_str()
            )));
        }

        if let Some(rejected) = self.rejections.get(&order_id)
            && rejected.contains(&driver_id)
        {
            return Err(AppError::Validation(format!(
                "driver {driver_id} already rejected order {order_id}"
            )));
        }

        order.status = OrderStatus::Accepted;
        order.driver_id = Some(driver_id);
        order.responded_at = Some(at);
        Ok(order.clone())
    }

    async fn record_rejection(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
    ) -> Result<Order, AppError> {
        let order = self
            .orders
            .get(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

        if order.status != OrderStatus::Pending {
            return Err(AppError::Conflict(format!(
                "order {} is no longer pending ({})",
                order_id,
                order.status.as_str()
            )));
        }

        self.rejections
            .entry(order_id)
            .or_default()
            .insert(driver_id);
        Ok(order.value().clone())
    }

    async fn rejected_drivers(&self, order_id: Uuid) -> Result<HashSet<Uuid>, AppError> {
        Ok(self
            .rejections
            .get(&order_id)
            .map(|set| set.value().clone())
            .unwrap_or_default())
    }

    async fn transition_status(
        &self,
        order_id: Uuid,
        next: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<Order, AppError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

        if !order.status.can_transition_to(next) {
            return Err(AppError::Validation(format!(
                "illegal transition {} -> {}",
                order.status.as_str(),
                next.as_str()
            )));
        }

        order.status = next;
        if next == OrderStatus::Completed {
            order.completed_at = Some(at);
        }
        Ok(order.clone())
    }

    async fn expire_if_pending(&self, order_id: Uuid) -> Result<Option<Order>, AppError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

        if order.status != OrderStatus::Pending {
            return Ok(None);
        }

        order.status = OrderStatus::Expired;
        Ok(Some(order.clone()))
    }

    async fn append_chat(&self, message: ChatMessage) -> Result<(), AppError> {
        self.chats.entry(message.order_id).or_default().push(message);
        Ok(())
    }

    async fn chat_history(&self, order_id: Uuid) -> Result<Vec<ChatMessage>, AppError> {
        Ok(self
            .chats
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn mark_read(&self, order_id: Uuid, message_id: Uuid) -> Result<bool, AppError> {
        let mut messages = self.chats.get_mut(&order_id).ok_or_else(|| {
            AppError::NotFound(format!("no chat channel for order {order_id}"))
        })?;

        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| AppError::NotFound(format!("message {message_id} not found")))?;

        if message.read {
            return Ok(false);
        }
        message.read = true;
        Ok(true)
    }

    async fn wallet_balance(&self, driver_id: Uuid) -> Result<Decimal, AppError> {
        Ok(self
            .wallets
            .get(&driver_id)
            .map(|acct| acct.balance)
            .unwrap_or_default())
    }

    async fn append_ledger(
        &self,
        driver_id: Uuid,
        delta: Decimal,
        reason: LedgerReason,
        order_id: Option<Uuid>,
    ) -> Result<WalletLedgerEntry, AppError> {
        let mut acct = self.wallets.entry(driver_id).or_default();
        Ok(acct.append(driver_id, delta, reason, order_id))
    }

    async fn ledger(&self, driver_id: Uuid) -> Result<Vec<WalletLedgerEntry>, AppError> {
        Ok(self
            .wallets
            .get(&driver_id)
            .map(|acct| acct.entries.clone())
            .unwrap_or_default())
    }

    async fn settle_completion(
        &self,
        order_id: Uuid,
        driver_id: Uuid,
        commission_fee: Decimal,
        at: DateTime<Utc>,
    ) -> Result<SettlementResult, AppError> {
        // Lock order: order entry first, then wallet entry. Every multi-entity
        // path takes them in this order.
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;

        if order.driver_id != Some(driver_id) {
            return Err(AppError::Validation(format!(
                "driver {driver_id} is not assigned to order {order_id}"
            )));
        }

        if order.status == OrderStatus::Completed {
            return Ok(SettlementResult::AlreadyCompleted(order.clone()));
        }

        if order.status != OrderStatus::InTransit {
            return Err(AppError::Validation(format!(
                "order {} cannot be completed from {}",
                order_id,
                order.status.as_str()
            )));
        }

        let mut acct = self.wallets.entry(driver_id).or_default();
        if acct.balance < commission_fee {
            return Err(AppError::InsufficientBalance {
                shortfall: commission_fee - acct.balance,
            });
        }

        let entry = acct.append(
            driver_id,
            -commission_fee,
            LedgerReason::Commission,
            Some(order_id),
        );
        drop(acct);

        order.status = OrderStatus::Completed;
        order.completed_at = Some(at);

        Ok(SettlementResult::Applied {
            order: order.clone(),
            entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::{MemStore, SettlementResult, Store};
    use crate::geo::GeoPoint;
    use crate::models::order::{Address, Order, OrderStatus};
    use crate::models::wallet::LedgerReason;

    fn order(id: u128, customer: u128) -> Order {
        Order {
            id: Uuid::from_u128(id),
            customer_id: Uuid::from_u128(customer),
            driver_id: None,
            status: OrderStatus::Pending,
            pickup: Address {
                label: "Warehouse 4".to_string(),
                point: GeoPoint { lat: 52.51, lng: 13.39 },
            },
            dropoff: Address {
                label: "Hauptstr. 12".to_string(),
                point: GeoPoint { lat: 52.54, lng: 13.42 },
            },
            fare: Decimal::new(1250, 2),
            distance_km: 4.2,
            package_description: None,
            recipient_phone: None,
            created_at: Utc::now(),
            expires_at: None,
            responded_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn bind_succeeds_once_then_conflicts() {
        let store = MemStore::new();
        store.insert_order(order(1, 2)).await.unwrap();

        let first = store
            .bind_driver_if_pending(Uuid::from_u128(1), Uuid::from_u128(10), Utc::now())
            .await
            .unwrap();
        assert_eq!(first.status, OrderStatus::Accepted);
        assert_eq!(first.driver_id, Some(Uuid::from_u128(10)));

        let second = store
            .bind_driver_if_pending(Uuid::from_u128(1), Uuid::from_u128(11), Utc::now())
            .await;
        assert!(matches!(second, Err(crate::error::AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn concurrent_binds_produce_exactly_one_winner() {
        let store = std::sync::Arc::new(MemStore::new());
        store.insert_order(order(1, 2)).await.unwrap();

        let mut handles = Vec::new();
        for driver in 0..8u128 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .bind_driver_if_pending(
                        Uuid::from_u128(1),
                        Uuid::from_u128(100 + driver),
                        Utc::now(),
                    )
                    .await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let stored = store.order(Uuid::from_u128(1)).await.unwrap();
        assert!(stored.driver_id.is_some());
    }

    #[tokio::test]
    async fn expire_is_idempotent() {
        let store = MemStore::new();
        store.insert_order(order(1, 2)).await.unwrap();

        assert!(store.expire_if_pending(Uuid::from_u128(1)).await.unwrap().is_some());
        assert!(store.expire_if_pending(Uuid::from_u128(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn settle_rejects_short_balance_and_leaves_state_unchanged() {
        let store = MemStore::new();
        let driver = Uuid::from_u128(10);
        store.insert_order(order(1, 2)).await.unwrap();
        store
            .bind_driver_if_pending(Uuid::from_u128(1), driver, Utc::now())
            .await
            .unwrap();
        store
            .transition_status(Uuid::from_u128(1), OrderStatus::PickedUp, Utc::now())
            .await
            .unwrap();
        store
            .transition_status(Uuid::from_u128(1), OrderStatus::InTransit, Utc::now())
            .await
            .unwrap();
        store
            .append_ledger(driver, Decimal::new(300, 2), LedgerReason::Topup, None)
            .await
            .unwrap();

        let result = store
            .settle_completion(Uuid::from_u128(1), driver, Decimal::new(500, 2), Utc::now())
            .await;

        match result {
            Err(crate::error::AppError::InsufficientBalance { shortfall }) => {
                assert_eq!(shortfall, Decimal::new(200, 2));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        assert_eq!(store.wallet_balance(driver).await.unwrap(), Decimal::new(300, 2));
        let stored = store.order(Uuid::from_u128(1)).await.unwrap();
        assert_eq!(stored.status, OrderStatus::InTransit);
        assert!(stored.completed_at.is_none());
    }

    #[tokio::test]
    async fn settle_twice_debits_once() {
        let store = MemStore::new();
        let driver = Uuid::from_u128(10);
        store.insert_order(order(1, 2)).await.unwrap();
        store
            .bind_driver_if_pending(Uuid::from_u128(1), driver, Utc::now())
            .await
            .unwrap();
        store
            .transition_status(Uuid::from_u128(1), OrderStatus::PickedUp, Utc::now())
            .await
            .unwrap();
        store
            .transition_status(Uuid::from_u128(1), OrderStatus::InTransit, Utc::now())
            .await
            .unwrap();
        store
            .append_ledger(driver, Decimal::new(2000, 2), LedgerReason::Topup, None)
            .await
            .unwrap();

        let fee = Decimal::new(500, 2);
        let first = store
            .settle_completion(Uuid::from_u128(1), driver, fee, Utc::now())
            .await
            .unwrap();
        assert!(matches!(first, SettlementResult::Applied { .. }));

        let second = store
            .settle_completion(Uuid::from_u128(1), driver, fee, Utc::now())
            .await
            .unwrap();
        assert!(matches!(second, SettlementResult::AlreadyCompleted(_)));

        assert_eq!(
            store.wallet_balance(driver).await.unwrap(),
            Decimal::new(1500, 2)
        );
        let commissions = store
            .ledger(driver)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.reason == LedgerReason::Commission)
            .count();
        assert_eq!(commissions, 1);
    }
}
