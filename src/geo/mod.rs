use crate::models::coordinate::Coordinate;

const EARTH_RADIUS_KM: f64 = 6_371.0;

pub fn haversine_km(a: &Coordinate, b: &Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let delta_lat = (b.latitude - a.latitude).to_radians();
    let delta_lng = (b.longitude - a.longitude).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

/// Straight-line interpolation in degree space. `t` is expected in `[0, 1]`;
/// the endpoints are returned verbatim so `t = 0` and `t = 1` are exact.
pub fn interpolate(start: &Coordinate, end: &Coordinate, t: f64) -> Coordinate {
    if t <= 0.0 {
        return *start;
    }
    if t >= 1.0 {
        return *end;
    }

    Coordinate::new(
        start.latitude + (end.latitude - start.latitude) * t,
        start.longitude + (end.longitude - start.longitude) * t,
    )
}

/// Quadratic ease-in-out.
pub fn ease_in_out(t: f64) -> f64 {
    if t < 0.5 {
        2.0 * t * t
    } else {
        let rest = 1.0 - t;
        1.0 - 2.0 * rest * rest
    }
}

/// Inverse of [`ease_in_out`] on `[0, 1]`.
pub fn ease_in_out_inverse(eased: f64) -> f64 {
    let eased = eased.clamp(0.0, 1.0);
    if eased < 0.5 {
        (eased / 2.0).sqrt()
    } else {
        1.0 - ((1.0 - eased) / 2.0).sqrt()
    }
}

/// Fraction of the `start -> target` leg already covered by `position`,
/// measured as great-circle distance from `start`. Zero-length legs count as
/// fully covered.
pub fn leg_fraction(start: &Coordinate, target: &Coordinate, position: &Coordinate) -> f64 {
    let total = haversine_km(start, target);
    if total <= f64::EPSILON {
        return 1.0;
    }

    (haversine_km(start, position) / total).clamp(0.0, 1.0)
}

/// Per-axis closeness check in degrees.
pub fn within_degrees(a: &Coordinate, b: &Coordinate, epsilon: f64) -> bool {
    (a.latitude - b.latitude).abs() < epsilon && (a.longitude - b.longitude).abs() < epsilon
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saigon() -> Coordinate {
        Coordinate::new(10.7769, 106.7009)
    }

    fn district_five() -> Coordinate {
        Coordinate::new(10.7500, 106.6500)
    }

    #[test]
    fn zero_distance_for_same_point() {
        let p = Coordinate::new(53.5511, 9.9937);
        assert_eq!(haversine_km(&p, &p), 0.0);
    }

    #[test]
    fn london_to_paris_is_around_343_km() {
        let london = Coordinate::new(51.5074, -0.1278);
        let paris = Coordinate::new(48.8566, 2.3522);
        let distance = haversine_km(&london, &paris);
        assert!((distance - 343.0).abs() < 5.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let pairs = [
            (saigon(), district_five()),
            (Coordinate::new(-33.8688, 151.2093), Coordinate::new(35.6762, 139.6503)),
            (Coordinate::new(0.0, 179.9), Coordinate::new(0.0, -179.9)),
        ];

        for (a, b) in pairs {
            assert_eq!(haversine_km(&a, &b), haversine_km(&b, &a));
        }
    }

    #[test]
    fn interpolate_hits_endpoints_exactly() {
        let a = saigon();
        let b = district_five();

        assert_eq!(interpolate(&a, &b, 0.0), a);
        assert_eq!(interpolate(&a, &b, 1.0), b);

        let mid = interpolate(&a, &b, 0.5);
        assert!((mid.latitude - 10.76345).abs() < 1e-9);
        assert!((mid.longitude - 106.67545).abs() < 1e-9);
    }

    #[test]
    fn ease_fixed_points() {
        assert_eq!(ease_in_out(0.0), 0.0);
        assert_eq!(ease_in_out(0.5), 0.5);
        assert_eq!(ease_in_out(1.0), 1.0);
    }

    #[test]
    fn ease_is_monotonic() {
        let mut previous = ease_in_out(0.0);
        for step in 1..=1000 {
            let value = ease_in_out(step as f64 / 1000.0);
            assert!(value >= previous);
            previous = value;
        }
    }

    #[test]
    fn inverse_ease_undoes_ease() {
        for step in 0..=20 {
            let t = step as f64 / 20.0;
            assert!((ease_in_out_inverse(ease_in_out(t)) - t).abs() < 1e-9);
        }
    }

    #[test]
    fn leg_fraction_tracks_position_along_leg() {
        let a = saigon();
        let b = district_five();

        assert_eq!(leg_fraction(&a, &b, &a), 0.0);
        assert_eq!(leg_fraction(&a, &b, &b), 1.0);
        assert!((leg_fraction(&a, &b, &interpolate(&a, &b, 0.25)) - 0.25).abs() < 0.01);
        assert_eq!(leg_fraction(&a, &a, &a), 1.0);
    }
}
