use chrono::{DateTime, TimeDelta, Utc};

use crate::engine::estimate::DeliveryEstimate;
use crate::models::order::{OrderRecord, OrderStatus};

/// Minutes until the order is expected at the door, never negative.
///
/// Uses the stored estimated-delivery timestamp; without one, falls back to
/// `assigned_at` plus the calculator's total minutes.
pub fn eta_minutes(
    order: &OrderRecord,
    estimate: Option<&DeliveryEstimate>,
    now: DateTime<Utc>,
) -> Option<f64> {
    match order.status {
        OrderStatus::Delivered => return Some(0.0),
        OrderStatus::Cancelled => return None,
        _ => {}
    }

    let due = order.estimated_delivery_time.or_else(|| {
        let assigned_at = order.assigned_at?;
        let estimate = estimate?;
        let total = TimeDelta::milliseconds((estimate.total_minutes * 60_000.0) as i64);
        Some(assigned_at + total)
    })?;

    let remaining_ms = (due - now).num_milliseconds() as f64;
    Some((remaining_ms / 60_000.0).max(0.0))
}
