//! Per-tick arbitration between authoritative realtime positions and the
//! local fallback animation.
//!
//! The reconciler is pure: every call takes the current time explicitly and
//! nothing here sleeps or spawns, so the tracking loop (or a test) decides
//! when ticks happen.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::engine::phase::{PhaseDurations, PhaseMachine, PhaseTransition};
use crate::engine::trail::PathTrail;
use crate::geo::{ease_in_out, ease_in_out_inverse, haversine_km, interpolate, leg_fraction};
use crate::models::coordinate::Coordinate;
use crate::models::session::{DeliveryPhase, PositionSource};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(3);

/// Share of overall progress covered by the hub -> restaurant leg.
pub const RESTAURANT_LEG_SHARE: f64 = 30.0;

/// A realtime position this close to the leg target counts as arrival.
const ARRIVAL_RADIUS_KM: f64 = 0.005;

/// Absorbs float drift from summing per-tick steps.
const PROGRESS_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Waypoints {
    pub hub: Option<Coordinate>,
    pub restaurant: Option<Coordinate>,
    pub customer: Option<Coordinate>,
}

impl Waypoints {
    /// `(start, target)` for flight phases.
    pub fn leg(&self, phase: DeliveryPhase) -> Option<(Coordinate, Coordinate)> {
        match phase {
            DeliveryPhase::ToRestaurant => self.hub.zip(self.restaurant),
            DeliveryPhase::ToCustomer => self.restaurant.zip(self.customer),
            _ => None,
        }
    }

    /// Where the drone rests while a non-flight phase runs.
    pub fn anchor(&self, phase: DeliveryPhase) -> Option<Coordinate> {
        match phase {
            DeliveryPhase::Idle => self.hub,
            DeliveryPhase::PickingUp => self.restaurant,
            DeliveryPhase::Delivering | DeliveryPhase::Completed => self.customer,
            DeliveryPhase::ToRestaurant | DeliveryPhase::ToCustomer => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    pub source: PositionSource,
    pub transition: Option<PhaseTransition>,
}

impl TickOutcome {
    fn held() -> Self {
        Self {
            source: PositionSource::Held,
            transition: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PositionReconciler {
    machine: PhaseMachine,
    waypoints: Waypoints,
    tick_interval: Duration,
    freshness_window: Duration,
    phase_progress: f64,
    phase_started_at: DateTime<Utc>,
    drone_coord: Option<Coordinate>,
    trail: PathTrail,
    realtime_coord: Option<Coordinate>,
    last_realtime_at: Option<DateTime<Utc>>,
    last_source: PositionSource,
}

impl PositionReconciler {
    pub fn new(
        durations: PhaseDurations,
        tick_interval: Duration,
        freshness_window: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            machine: PhaseMachine::new(durations),
            waypoints: Waypoints::default(),
            tick_interval,
            freshness_window,
            phase_progress: 0.0,
            phase_started_at: now,
            drone_coord: None,
            trail: PathTrail::default(),
            realtime_coord: None,
            last_realtime_at: None,
            last_source: PositionSource::Held,
        }
    }

    pub fn phase(&self) -> DeliveryPhase {
        self.machine.phase()
    }

    pub fn phase_progress(&self) -> f64 {
        self.phase_progress
    }

    pub fn phase_started_at(&self) -> DateTime<Utc> {
        self.phase_started_at
    }

    pub fn drone_coord(&self) -> Option<Coordinate> {
        self.drone_coord
    }

    pub fn trail(&self) -> &PathTrail {
        &self.trail
    }

    pub fn waypoints(&self) -> &Waypoints {
        &self.waypoints
    }

    pub fn last_realtime_at(&self) -> Option<DateTime<Utc>> {
        self.last_realtime_at
    }

    pub fn last_source(&self) -> PositionSource {
        self.last_source
    }

    /// Overall journey progress in percent.
    pub fn overall_progress(&self) -> f64 {
        let p = self.phase_progress.clamp(0.0, 1.0);
        match self.phase() {
            DeliveryPhase::Idle => 0.0,
            DeliveryPhase::ToRestaurant => RESTAURANT_LEG_SHARE * p,
            DeliveryPhase::PickingUp => RESTAURANT_LEG_SHARE,
            DeliveryPhase::ToCustomer => {
                RESTAURANT_LEG_SHARE + (100.0 - RESTAURANT_LEG_SHARE) * p
            }
            DeliveryPhase::Delivering | DeliveryPhase::Completed => 100.0,
        }
    }

    /// Replaces the session waypoints (initial resolution or an explicit
    /// re-fetch) and places the drone if it has no position yet.
    pub fn set_waypoints(&mut self, waypoints: Waypoints) {
        self.waypoints = waypoints;
        if self.drone_coord.is_none() {
            self.place();
        }
    }

    /// Seeds a session that joins mid-delivery. For flight phases the last
    /// reported coordinate is projected onto the active leg so the animation
    /// resumes roughly where the drone was.
    pub fn resume(
        &mut self,
        phase: DeliveryPhase,
        last_known: Option<Coordinate>,
        now: DateTime<Utc>,
    ) -> Option<PhaseTransition> {
        let transition = self.machine.sync_to(phase);
        if transition.is_some() {
            self.phase_progress = 0.0;
            self.phase_started_at = now;
        }

        if let (Some((start, target)), Some(position)) =
            (self.waypoints.leg(self.phase()), last_known)
        {
            self.phase_progress = ease_in_out_inverse(leg_fraction(&start, &target, &position));
        }

        self.place();
        transition
    }

    /// Forward-only jump requested by an external signal.
    pub fn sync_phase(
        &mut self,
        target: DeliveryPhase,
        now: DateTime<Utc>,
    ) -> Option<PhaseTransition> {
        let transition = self.machine.sync_to(target)?;
        self.enter_phase(now);
        Some(transition)
    }

    /// Records an authoritative position. It is displayed immediately while a
    /// phase is active and owns the position on ticks until it goes stale.
    pub fn apply_realtime(&mut self, coordinate: Coordinate, at: DateTime<Utc>) -> bool {
        self.realtime_coord = Some(coordinate);
        self.last_realtime_at = Some(at);

        if !self.phase().is_active() {
            return false;
        }

        self.show(coordinate);
        true
    }

    pub fn is_realtime_fresh(&self, now: DateTime<Utc>) -> bool {
        match (self.last_realtime_at, self.realtime_coord) {
            (Some(at), Some(_)) => (now - at)
                .to_std()
                .map(|age| age <= self.freshness_window)
                // Timestamps slightly ahead of `now` are fresh.
                .unwrap_or(true),
            _ => false,
        }
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let phase = self.phase();
        let Some(duration) = self.machine.current_duration() else {
            self.last_source = PositionSource::Held;
            return TickOutcome::held();
        };

        let fresh = self.is_realtime_fresh(now);
        let source = if phase.is_flight() {
            let Some((start, target)) = self.waypoints.leg(phase) else {
                debug!(%phase, "waypoints unresolved; skipping tick");
                self.last_source = PositionSource::Held;
                return TickOutcome::held();
            };

            match self.realtime_coord.filter(|_| fresh) {
                Some(remote) => {
                    let fraction = if haversine_km(&remote, &target) < ARRIVAL_RADIUS_KM {
                        1.0
                    } else {
                        leg_fraction(&start, &target, &remote)
                    };
                    self.phase_progress = ease_in_out_inverse(fraction);
                    self.show(remote);
                    PositionSource::Realtime
                }
                None => {
                    self.advance_progress(duration);
                    let eased = ease_in_out(self.phase_progress);
                    self.show(interpolate(&start, &target, eased));
                    PositionSource::Local
                }
            }
        } else {
            let Some(anchor) = self.waypoints.anchor(phase) else {
                debug!(%phase, "waypoints unresolved; skipping tick");
                self.last_source = PositionSource::Held;
                return TickOutcome::held();
            };

            self.advance_progress(duration);
            match self.realtime_coord.filter(|_| fresh) {
                Some(remote) => {
                    self.show(remote);
                    PositionSource::Realtime
                }
                None => {
                    self.show(anchor);
                    PositionSource::Local
                }
            }
        };

        let transition = if self.phase_progress >= 1.0 {
            let transition = self.machine.advance();
            if transition.is_some() {
                self.enter_phase(now);
            }
            transition
        } else {
            None
        };

        self.last_source = source;
        TickOutcome { source, transition }
    }

    fn advance_progress(&mut self, duration: Duration) {
        let step = if duration.is_zero() {
            1.0
        } else {
            self.tick_interval.as_secs_f64() / duration.as_secs_f64()
        };

        let progress = self.phase_progress + step;
        self.phase_progress = if progress >= 1.0 - PROGRESS_EPSILON {
            1.0
        } else {
            progress
        };
    }

    fn enter_phase(&mut self, now: DateTime<Utc>) {
        self.phase_progress = 0.0;
        self.phase_started_at = now;
        self.place();
    }

    /// Puts the drone where the current phase and progress say it is.
    fn place(&mut self) {
        let phase = self.phase();
        let position = match self.waypoints.leg(phase) {
            Some((start, target)) => {
                Some(interpolate(&start, &target, ease_in_out(self.phase_progress)))
            }
            None => self.waypoints.anchor(phase),
        };

        if let Some(position) = position {
            self.show(position);
        }
    }

    fn show(&mut self, position: Coordinate) {
        self.drone_coord = Some(position);
        self.trail.push(position);
    }
}
