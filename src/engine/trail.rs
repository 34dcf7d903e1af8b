use std::collections::VecDeque;

use crate::geo::haversine_km;
use crate::models::coordinate::Coordinate;

pub const MAX_TRAIL_POINTS: usize = 50;
pub const MIN_SPACING_KM: f64 = 0.001;

/// Bounded breadcrumb trail of displayed drone positions.
///
/// A point within [`MIN_SPACING_KM`] of the tail replaces the tail instead of
/// extending the trail, so the last point always equals the latest position.
#[derive(Debug, Clone)]
pub struct PathTrail {
    points: VecDeque<Coordinate>,
    capacity: usize,
}

impl Default for PathTrail {
    fn default() -> Self {
        Self::with_capacity(MAX_TRAIL_POINTS)
    }
}

impl PathTrail {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `true` when the trail grew.
    pub fn push(&mut self, point: Coordinate) -> bool {
        if let Some(tail) = self.points.back_mut() {
            if haversine_km(tail, &point) < MIN_SPACING_KM {
                *tail = point;
                return false;
            }
        }

        self.points.push_back(point);
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
        true
    }

    pub fn to_vec(&self) -> Vec<Coordinate> {
        self.points.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(i: usize) -> Coordinate {
        // ~11 m apart
        Coordinate::new(10.0 + i as f64 * 0.0001, 106.0)
    }

    #[test]
    fn keeps_only_most_recent_points() {
        let mut trail = PathTrail::default();
        for i in 0..120 {
            trail.push(point(i));
        }

        let points = trail.to_vec();
        assert_eq!(points.len(), MAX_TRAIL_POINTS);
        assert_eq!(points.first(), Some(&point(70)));
        assert_eq!(points.last(), Some(&point(119)));
    }

    #[test]
    fn near_duplicate_replaces_tail() {
        let mut trail = PathTrail::default();
        assert!(trail.push(point(0)));

        let jitter = Coordinate::new(10.000001, 106.000001);
        assert!(!trail.push(jitter));

        assert_eq!(trail.to_vec(), vec![jitter]);
            }

    #[test]
    fn tail_always_matches_latest_push() {
        let mut trail = PathTrail::default();
        for i in 0..10 {
            let p = point(i / 2);
            trail.push(p);
            assert_eq!(trail.to_vec().last(), Some(&p));
        }
        assert_eq!(trail.to_vec().len(), 5);
    }
}
