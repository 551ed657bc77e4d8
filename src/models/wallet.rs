use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    Topup,
    Commission,
    Adjustment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletLedgerEntry {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub delta: Decimal,
    pub reason: LedgerReason,
    pub balance_after: Decimal,
    pub order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
