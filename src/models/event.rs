use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;
use crate::models::chat::ChatMessage;
use crate::models::order::OrderStatus;
use crate::models::wallet::WalletLedgerEntry;

/// Wire envelope for everything that crosses the bus: `{type, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusEvent {
    StatusUpdate(StatusUpdate),
    LocationUpdate(LocationUpdate),
    ChatMessage(ChatMessage),
    TransactionUpdate(TransactionUpdate),
    BookingAccepted(BookingUpdate),
    BookingRejected(BookingUpdate),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub driver_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtaEstimate {
    pub distance_meters: f64,
    pub duration_seconds: f64,
    pub stale: bool,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub driver_id: Uuid,
    pub order_id: Option<Uuid>,
    pub point: GeoPoint,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub captured_at: DateTime<Utc>,
    pub eta: Option<EtaEstimate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionUpdate {
    pub driver_id: Uuid,
    pub entry: WalletLedgerEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingUpdate {
    pub order_id: Uuid,
    pub driver_id: Uuid,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::{BusEvent, StatusUpdate};
    use crate::models::order::OrderStatus;

    #[test]
    fn envelope_serializes_with_type_and_data_fields() {
        let event = BusEvent::StatusUpdate(StatusUpdate {
            order_id: Uuid::from_u128(7),
            status: OrderStatus::Accepted,
            driver_id: Some(Uuid::from_u128(9)),
            at: Utc::now(),
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "STATUS_UPDATE");
        assert_eq!(value["data"]["status"], "accepted");

        let back: BusEvent = serde_json::from_value(value).unwrap();
        match back {
            BusEvent::StatusUpdate(update) => assert_eq!(update.status, OrderStatus::Accepted),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
