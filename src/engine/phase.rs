use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::geo::{haversine_km, within_degrees};
use crate::models::coordinate::Coordinate;
use crate::models::drone::DroneEventType;
use crate::models::order::OrderStatus;
use crate::models::session::DeliveryPhase;

/// ~0.001 degrees is a few tens of meters at delivery latitudes.
pub const WAYPOINT_EPSILON_DEG: f64 = 0.001;

/// How long each active phase lasts when animated locally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseDurations {
    pub to_restaurant: Duration,
    pub picking_up: Duration,
    pub to_customer: Duration,
    pub delivering: Duration,
}

impl PhaseDurations {
    pub fn for_phase(&self, phase: DeliveryPhase) -> Option<Duration> {
        match phase {
            DeliveryPhase::ToRestaurant => Some(self.to_restaurant),
            DeliveryPhase::PickingUp => Some(self.picking_up),
            DeliveryPhase::ToCustomer => Some(self.to_customer),
            DeliveryPhase::Delivering => Some(self.delivering),
            DeliveryPhase::Idle | DeliveryPhase::Completed => None,
        }
    }
}

/// Named duration sets. The admin simulator drives the authoritative
/// position; the passive preset is the client's fallback animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationPreset {
    AdminSimulator,
    PassiveClient,
}

impl DurationPreset {
    pub fn durations(self) -> PhaseDurations {
        match self {
            DurationPreset::AdminSimulator => PhaseDurations {
                to_restaurant: Duration::from_secs(20),
                picking_up: Duration::from_secs(5),
                to_customer: Duration::from_secs(30),
                delivering: Duration::from_secs(3),
            },
            DurationPreset::PassiveClient => PhaseDurations {
                to_restaurant: Duration::from_secs(30),
                picking_up: Duration::from_secs(5),
                to_customer: Duration::from_secs(45),
                delivering: Duration::from_secs(3),
            },
        }
    }
}

impl FromStr for DurationPreset {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" | "simulator" => Ok(DurationPreset::AdminSimulator),
            "passive" | "client" => Ok(DurationPreset::PassiveClient),
            other => Err(format!("unknown phase preset '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    pub from: DeliveryPhase,
    pub to: DeliveryPhase,
}

impl PhaseTransition {
    pub fn completed(&self) -> bool {
        self.to == DeliveryPhase::Completed
    }
}

/// Forward-only delivery lifecycle.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    phase: DeliveryPhase,
    durations: PhaseDurations,
}

impl PhaseMachine {
    pub fn new(durations: PhaseDurations) -> Self {
        Self::starting_at(DeliveryPhase::Idle, durations)
    }

    pub fn starting_at(phase: DeliveryPhase, durations: PhaseDurations) -> Self {
        Self { phase, durations }
    }

    pub fn phase(&self) -> DeliveryPhase {
        self.phase
    }

    pub fn current_duration(&self) -> Option<Duration> {
        self.durations.for_phase(self.phase)
    }

    /// Steps to the next phase in order. Completed stays completed.
    pub fn advance(&mut self) -> Option<PhaseTransition> {
        let next = self.phase.next();
        if next == self.phase {
            return None;
        }

        let transition = PhaseTransition {
            from: self.phase,
            to: next,
        };
        self.phase = next;
        Some(transition)
    }

    /// Jumps to `target` on an external signal. Anything that is not strictly
    /// ahead of the current phase is ignored.
    pub fn sync_to(&mut self, target: DeliveryPhase) -> Option<PhaseTransition> {
        if target <= self.phase {
            if target < self.phase {
                debug!(current = %self.phase, requested = %target, "ignoring phase regression");
            }
            return None;
        }

        let transition = PhaseTransition {
            from: self.phase,
            to: target,
        };
        self.phase = target;
        Some(transition)
    }
}

/// Best-effort recovery of the phase for a session that joins mid-delivery.
///
/// Status alone is ambiguous once the drone is airborne: `delivering` is set
/// when the drone leaves the hub, so a drone still sitting on the hub is
/// heading to the restaurant. Anything else in flight is treated as the
/// customer leg. This is a heuristic, not a guarantee.
pub fn infer_phase(
    status: OrderStatus,
    drone_position: Option<&Coordinate>,
    hub: Option<&Coordinate>,
    restaurant: Option<&Coordinate>,
) -> DeliveryPhase {
    match status {
        OrderStatus::Delivered => DeliveryPhase::Completed,
        OrderStatus::PickedUp => DeliveryPhase::ToCustomer,
        OrderStatus::Delivering => match (drone_position, hub) {
            (Some(drone), Some(hub)) if within_degrees(drone, hub, WAYPOINT_EPSILON_DEG) => {
                DeliveryPhase::ToRestaurant
            }
            (Some(drone), Some(hub)) => match restaurant {
                Some(restaurant) if within_degrees(drone, restaurant, WAYPOINT_EPSILON_DEG) => {
                    DeliveryPhase::ToCustomer
                }
                Some(restaurant)
                    if haversine_km(drone, hub) < haversine_km(drone, restaurant)
                        && haversine_km(drone, restaurant) < haversine_km(hub, restaurant) =>
                {
                    DeliveryPhase::ToRestaurant
                }
                _ => DeliveryPhase::ToCustomer,
            },
            _ => DeliveryPhase::ToCustomer,
        },
        OrderStatus::Pending
        | OrderStatus::Confirmed
        | OrderStatus::Preparing
        | OrderStatus::Ready
        | OrderStatus::Cancelled => DeliveryPhase::Idle,
    }
}

/// Phase a drone event announces, if any.
pub fn phase_for_event(event_type: DroneEventType) -> Option<DeliveryPhase> {
    match event_type {
        DroneEventType::DeliveryStarted => Some(DeliveryPhase::ToRestaurant),
        DroneEventType::ArrivedAtRestaurant => Some(DeliveryPhase::PickingUp),
        DroneEventType::PickedUp => Some(DeliveryPhase::ToCustomer),
        DroneEventType::ArrivedAtCustomer => Some(DeliveryPhase::Delivering),
        DroneEventType::Delivered => Some(DeliveryPhase::Completed),
        DroneEventType::Unknown => None,
    }
}

/// Event announcing entry into `phase`; the inverse of [`phase_for_event`].
pub fn event_for_phase(phase: DeliveryPhase) -> Option<DroneEventType> {
    match phase {
        DeliveryPhase::ToRestaurant => Some(DroneEventType::DeliveryStarted),
        DeliveryPhase::PickingUp => Some(DroneEventType::ArrivedAtRestaurant),
        DeliveryPhase::ToCustomer => Some(DroneEventType::PickedUp),
        DeliveryPhase::Delivering => Some(DroneEventType::ArrivedAtCustomer),
        DeliveryPhase::Completed => Some(DroneEventType::Delivered),
        DeliveryPhase::Idle => None,
    }
}
