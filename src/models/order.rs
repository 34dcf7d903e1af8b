use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::coordinate::Coordinate;
use crate::models::reference::optional_id;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    PickedUp,
    Delivering,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// The drone has left the hub for this order.
    pub fn is_in_flight(self) -> bool {
        matches!(self, OrderStatus::PickedUp | OrderStatus::Delivering)
    }

    /// Stage of the order lifecycle. Both in-flight statuses share a stage,
    /// as do both terminal ones.
    pub fn rank(self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Confirmed => 1,
            OrderStatus::Preparing => 2,
            OrderStatus::Ready => 3,
            OrderStatus::PickedUp | OrderStatus::Delivering => 4,
            OrderStatus::Delivered | OrderStatus::Cancelled => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    #[serde(default)]
    pub id: String,
    pub status: OrderStatus,
    #[serde(default, alias = "drone", deserialize_with = "optional_id")]
    pub drone_id: Option<String>,
    #[serde(default, alias = "restaurant", deserialize_with = "optional_id")]
    pub restaurant_id: Option<String>,
    #[serde(default)]
    pub delivery_address: String,
    #[serde(default)]
    pub delivery_latitude: Option<f64>,
    #[serde(default)]
    pub delivery_longitude: Option<f64>,
    #[serde(default)]
    pub estimated_delivery_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
}

impl OrderRecord {
    pub fn delivery_coordinate(&self) -> Option<Coordinate> {
        Coordinate::from_parts(self.delivery_latitude, self.delivery_longitude)
    }
}

/// Partial order document pushed over the realtime bus. Any field may be
/// missing, so it is only ever used as a hint to re-fetch the full record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderUpdate {
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default, alias = "drone", deserialize_with = "optional_id")]
    pub drone_id: Option<String>,
    #[serde(default)]
    pub estimated_delivery_time: Option<DateTime<Utc>>,
}
