use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
    PickedUp,
    InTransit,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::Completed
                | OrderStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Accepted)
                | (Pending, Rejected)
                | (Pending, Expired)
                | (Accepted, PickedUp)
                | (Accepted, Cancelled)
                | (PickedUp, InTransit)
                | (InTransit, Completed)
                | (InTransit, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Accepted => "accepted",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
            OrderStatus::PickedUp => "picked_up",
            OrderStatus::InTransit => "in_transit",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub label: String,
    pub point: GeoPoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub status: OrderStatus,
    pub pickup: Address,
    pub dropoff: Address,
    pub fare: Decimal,
    pub distance_km: f64,
    pub package_description: Option<String>,
    pub recipient_phone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub responded_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Accepted | OrderStatus::PickedUp | OrderStatus::InTransit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::OrderStatus;

    #[test]
    fn graph_allows_only_declared_edges() {
        use OrderStatus::*;
        let all = [
            Pending, Accepted, Rejected, Expired, PickedUp, InTransit, Completed, Cancelled,
        ];

        let legal = [
            (Pending, Accepted),
            (Pending, Rejected),
            (Pending, Expired),
            (Accepted, PickedUp),
            (Accepted, Cancelled),
            (PickedUp, InTransit),
            (InTransit, Completed),
            (InTransit, Cancelled),
        ];

        for from in all {
            for to in all {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        use OrderStatus::*;
        let all = [
            Pending, Accepted, Rejected, Expired, PickedUp, InTransit, Completed, Cancelled,
        ];

        for from in all.into_iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to));
            }
        }
    }
}
