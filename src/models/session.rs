use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::coordinate::Coordinate;
use crate::models::order::OrderStatus;

/// Delivery lifecycle of a drone, in progression order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPhase {
    Idle,
    ToRestaurant,
    PickingUp,
    ToCustomer,
    Delivering,
    Completed,
}

impl DeliveryPhase {
    pub fn next(self) -> Self {
        match self {
            DeliveryPhase::Idle => DeliveryPhase::ToRestaurant,
            DeliveryPhase::ToRestaurant => DeliveryPhase::PickingUp,
            DeliveryPhase::PickingUp => DeliveryPhase::ToCustomer,
            DeliveryPhase::ToCustomer => DeliveryPhase::Delivering,
            DeliveryPhase::Delivering | DeliveryPhase::Completed => DeliveryPhase::Completed,
        }
    }

    /// Phases that move the drone between two waypoints.
    pub fn is_flight(self) -> bool {
        matches!(self, DeliveryPhase::ToRestaurant | DeliveryPhase::ToCustomer)
    }

    /// Phases that consume time on a tick (everything but idle/completed).
    pub fn is_active(self) -> bool {
        !matches!(self, DeliveryPhase::Idle | DeliveryPhase::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryPhase::Idle => "idle",
            DeliveryPhase::ToRestaurant => "to_restaurant",
            DeliveryPhase::PickingUp => "picking_up",
            DeliveryPhase::ToCustomer => "to_customer",
            DeliveryPhase::Delivering => "delivering",
            DeliveryPhase::Completed => "completed",
        }
    }
}

impl fmt::Display for DeliveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which input produced the displayed drone position on the last tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    /// No tick has moved the drone (idle, completed, or waypoints pending).
    Held,
    Realtime,
    Local,
}

impl PositionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionSource::Held => "held",
            PositionSource::Realtime => "realtime",
            PositionSource::Local => "local",
        }
    }
}

/// What the map/UI sees of a tracking session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    pub order_id: String,
    pub drone_id: Option<String>,
    pub order_status: OrderStatus,
    pub phase: DeliveryPhase,
    pub phase_started_at: DateTime<Utc>,
    pub phase_progress: f64,
    pub overall_progress: f64,
    pub drone_coord: Option<Coordinate>,
    pub path_history: Vec<Coordinate>,
    pub hub: Option<Coordinate>,
    pub restaurant: Option<Coordinate>,
    pub customer: Option<Coordinate>,
    pub position_source: PositionSource,
    pub last_realtime_update_at: Option<DateTime<Utc>>,
    pub eta_minutes: Option<f64>,
    pub updated_at: DateTime<Utc>,
}
