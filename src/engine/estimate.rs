use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::geo::haversine_km;
use crate::models::coordinate::Coordinate;
use crate::store::Geocoder;

pub const MIN_DISTANCE_KM: f64 = 1.0;
pub const MINUTES_PER_KM: f64 = 0.5;
pub const MIN_DELIVERY_MINUTES: f64 = 0.5;
pub const PREPARATION_MINUTES: f64 = 15.0;
pub const COST_PER_KM: f64 = 3_000.0;
pub const MIN_SHIPPING_COST: u64 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEstimate {
    pub distance_km: f64,
    pub delivery_minutes: f64,
    pub preparation_minutes: f64,
    pub total_minutes: f64,
    pub shipping_cost: u64,
}

pub fn calculate(restaurant: &Coordinate, customer: &Coordinate) -> DeliveryEstimate {
    estimate_for_distance(haversine_km(restaurant, customer))
}

/// Applies rounding and the billing floors to a raw great-circle distance.
pub fn estimate_for_distance(raw_distance_km: f64) -> DeliveryEstimate {
    // Work in whole tenths of a km so the per-km rates stay exact.
    let min_tenths = (MIN_DISTANCE_KM * 10.0) as u64;
    let tenths = ((raw_distance_km.max(0.0) * 10.0).round() as u64).max(min_tenths);
    let distance_km = tenths as f64 / 10.0;

    let delivery_minutes =
        (tenths as f64 * MINUTES_PER_KM / 10.0).ceil().max(MIN_DELIVERY_MINUTES);
    let shipping_cost = (tenths * (COST_PER_KM as u64) / 10).max(MIN_SHIPPING_COST);

    DeliveryEstimate {
        distance_km,
        delivery_minutes,
        preparation_minutes: PREPARATION_MINUTES,
        total_minutes: PREPARATION_MINUTES + delivery_minutes,
        shipping_cost,
    }
}

/// Geocodes `address` first. A failed lookup is not surfaced: the estimate
/// falls back to the minimum billable distance.
pub async fn calculate_from_address(
    geocoder: &dyn Geocoder,
    restaurant: &Coordinate,
    address: &str,
) -> DeliveryEstimate {
    match geocoder.geocode(address).await {
        Ok(customer) => calculate(restaurant, &customer),
        Err(err) => {
            warn!(address, error = %err, "geocoding failed; using minimum-distance estimate");
            estimate_for_distance(MIN_DISTANCE_KM)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::StaticGeocoder;

    #[test]
    fn saigon_example_matches_rates() {
        let restaurant = Coordinate::new(10.7769, 106.7009);
        let customer = Coordinate::new(10.7500, 106.6500);

        let estimate = calculate(&restaurant, &customer);

        assert!((estimate.distance_km - 6.4).abs() <= 0.2);
        assert_eq!(estimate.distance_km, 6.3);
        assert_eq!(estimate.delivery_minutes, 4.0);
        assert_eq!(estimate.total_minutes, 19.0);
        assert_eq!(estimate.shipping_cost, 18_900);
    }

    #[test]
    fn identical_points_are_billed_as_minimum_distance() {
        let p = Coordinate::new(10.7769, 106.7009);
        let estimate = calculate(&p, &p);

        assert_eq!(estimate.distance_km, MIN_DISTANCE_KM);
        assert_eq!(estimate.shipping_cost, MIN_SHIPPING_COST);
        assert!(estimate.delivery_minutes >= MIN_DELIVERY_MINUTES);
    }

    #[test]
    fn floors_hold_for_short_hops() {
        let origin = Coordinate::new(10.7769, 106.7009);
        for step in 0..20 {
            let nearby = Coordinate::new(10.7769 + step as f64 * 0.0004, 106.7009);
            let estimate = calculate(&origin, &nearby);
            assert!(estimate.shipping_cost >= MIN_SHIPPING_COST);
            assert!(estimate.delivery_minutes >= MIN_DELIVERY_MINUTES);
        }
    }

    #[test]
    fn distance_is_rounded_to_one_decimal() {
        let estimate = estimate_for_distance(12.345);
        assert_eq!(estimate.distance_km, 12.3);
        assert_eq!(estimate.shipping_cost, 36_900);
        assert_eq!(estimate.delivery_minutes, 7.0);
    }

    #[tokio::test]
    async fn address_estimate_uses_geocoded_point() {
        let geocoder = StaticGeocoder::new();
        geocoder.insert("District 5", Coordinate::new(10.7500, 106.6500));
        let restaurant = Coordinate::new(10.7769, 106.7009);

        let estimate = calculate_from_address(&geocoder, &restaurant, "district 5").await;

        assert_eq!(estimate, calculate(&restaurant, &Coordinate::new(10.7500, 106.6500)));
    }

    #[tokio::test]
    async fn unknown_address_degrades_to_minimum_estimate() {
        let geocoder = StaticGeocoder::new();
        let restaurant = Coordinate::new(10.7769, 106.7009);

        let estimate = calculate_from_address(&geocoder, &restaurant, "nowhere").await;

        assert_eq!(estimate, estimate_for_distance(MIN_DISTANCE_KM));
    }
}
