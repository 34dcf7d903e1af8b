//! Tracking session lifecycle: subscriptions, the position tick, the ETA
//! timer and completion side effects for one order.
//!
//! Each session runs as a single task. Ticks, realtime messages and re-fetch
//! results are handled one at a time from the same `select!` loop, so no tick
//! ever overlaps another and the reconciler needs no lock. Anything that talks
//! to the backend after start-up is spawned and reports back over a channel,
//! which keeps a slow write or fetch from delaying the next tick.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::config::TrackingConfig;
use crate::engine::estimate::{self, DeliveryEstimate};
use crate::engine::eta::eta_minutes;
use crate::engine::phase::{PhaseTransition, infer_phase, phase_for_event};
use crate::engine::reconciler::{PositionReconciler, Waypoints};
use crate::error::AppError;
use crate::models::coordinate::Coordinate;
use crate::models::drone::{DroneEvent, DroneRecord, DroneStatus, DroneUpdate};
use crate::models::order::{OrderRecord, OrderStatus, OrderUpdate};
use crate::models::session::{DeliveryPhase, SessionSnapshot};
use crate::observability::metrics::Metrics;
use crate::store::{Collaborators, Subscription};

const REFRESH_BUFFER: usize = 16;

/// Starts tracking sessions against injected collaborators.
#[derive(Clone)]
pub struct TrackingSessionController {
    collaborators: Collaborators,
    config: TrackingConfig,
    metrics: Metrics,
}

impl TrackingSessionController {
    pub fn new(collaborators: Collaborators, config: TrackingConfig, metrics: Metrics) -> Self {
        Self {
            collaborators,
            config,
            metrics,
        }
    }

    /// Loads the order, resolves waypoints, recovers the current phase and
    /// spawns the session loop.
    ///
    /// Fails only when there is no order id or the initial order fetch fails;
    /// every later backend error is absorbed by the running session.
    pub async fn start(&self, order_id: &str) -> Result<TrackingHandle, AppError> {
        let order_id = order_id.trim();
        if order_id.is_empty() {
            return Err(AppError::MissingOrderId);
        }

        let order = self
            .collaborators
            .orders
            .get_order(order_id)
            .await
            .map_err(|err| {
                warn!(order_id, error = %err, "initial order fetch failed");
                AppError::OrderUnavailable(order_id.to_string())
            })?;

        let drone = match order.drone_id.as_deref() {
            Some(drone_id) => fetch_drone(&self.collaborators, drone_id).await,
            None => None,
        };
        let waypoints =
            resolve_waypoints(&self.collaborators, &order, drone.as_ref(), self.config.default_hub)
                .await;

        let now = Utc::now();
        let mut reconciler = PositionReconciler::new(
            self.config.phase_durations,
            self.config.tick_interval,
            self.config.freshness_window,
            now,
        );
        reconciler.set_waypoints(waypoints);

        let last_drone_position = drone.as_ref().map(DroneRecord::position);
        let phase = infer_phase(
            order.status,
            last_drone_position.as_ref(),
            waypoints.hub.as_ref(),
            waypoints.restaurant.as_ref(),
        );
        reconciler.resume(phase, last_drone_position, now);

        let bus = &self.collaborators.bus;
        let order_sub = bus.subscribe_to_order(order_id);
        let event_sub = bus.subscribe_to_drone_events(order_id);
        let position_sub = order
            .drone_id
            .as_deref()
            .map(|drone_id| bus.subscribe_to_drone_position(drone_id));

        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_BUFFER);
        let mut session = TrackingSession {
            order_id: order_id.to_string(),
            estimate: estimate_between(&waypoints),
            eta_minutes: None,
            eta_active: !order.status.is_terminal(),
            completion_requested: order.status == OrderStatus::Delivered,
            drone_pending: false,
            order,
            reconciler,
            last_drone_position,
            collaborators: self.collaborators.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            snapshot_tx: None,
            refresh_tx,
            refresh_rx,
            order_sub: Some(order_sub),
            position_sub,
            event_sub: Some(event_sub),
        };
        session.eta_minutes = eta_minutes(&session.order, session.estimate.as_ref(), now);

        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot(now));
        session.snapshot_tx = Some(snapshot_tx);

        info!(
            order_id,
            phase = %session.reconciler.phase(),
            status = ?session.order.status,
            drone_id = ?session.order.drone_id,
            "tracking session started"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(session.run(shutdown_rx));

        Ok(TrackingHandle {
            order_id: order_id.to_string(),
            snapshot_rx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// Owner-side view of a running session. Dropping it stops the session.
pub struct TrackingHandle {
    order_id: String,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TrackingHandle {
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receives a fresh snapshot on every change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some() && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Signals the session to stop. Safe to call any number of times;
    /// returns `true` only for the call that actually stopped it.
    pub fn stop(&mut self) -> bool {
        match self.shutdown_tx.take() {
            Some(shutdown) => {
                let _ = shutdown.send(());
                debug!(order_id = %self.order_id, "tracking stop requested");
                true
            }
            None => false,
        }
    }

    /// Stops the session and waits until its subscriptions are released.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(order_id = %self.order_id, error = %err, "tracking task ended abnormally");
            }
        }
    }
}

impl Drop for TrackingHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Refresh {
    Order(OrderRecord),
    /// Result of fetching a newly assigned drone; `None` when the fetch failed.
    Drone(String, Option<DroneRecord>),
    Waypoints(Waypoints),
}

#[derive(Debug, Clone, Copy)]
enum Feed {
    Order,
    DronePosition,
    DroneEvents,
}

impl Feed {
    fn as_str(self) -> &'static str {
        match self {
            Feed::Order => "order",
            Feed::DronePosition => "drone_position",
            Feed::DroneEvents => "drone_events",
        }
    }
}

struct TrackingSession {
    order_id: String,
    order: OrderRecord,
    reconciler: PositionReconciler,
    estimate: Option<DeliveryEstimate>,
    eta_minutes: Option<f64>,
    eta_active: bool,
    completion_requested: bool,
    /// A drone was just assigned and its record is still being fetched.
    drone_pending: bool,
    last_drone_position: Option<Coordinate>,
    collaborators: Collaborators,
    config: TrackingConfig,
    metrics: Metrics,
    snapshot_tx: Option<watch::Sender<SessionSnapshot>>,
    refresh_tx: mpsc::Sender<Refresh>,
    refresh_rx: mpsc::Receiver<Refresh>,
    order_sub: Option<Subscription<OrderUpdate>>,
    position_sub: Option<Subscription<Coordinate>>,
    event_sub: Option<Subscription<DroneEvent>>,
}

impl TrackingSession {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        self.metrics.sessions_active.inc();

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut eta_timer = interval(self.config.eta_refresh);
        eta_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let eta_active = self.eta_active;
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.on_tick(Utc::now()),
                _ = eta_timer.tick(), if eta_active => self.refresh_eta(Utc::now()),
                update = next_message(&mut self.order_sub) => match update {
                    Some(update) => self.on_order_update(update),
                    None => self.feed_lost(Feed::Order),
                },
                position = next_message(&mut self.position_sub) => match position {
                    Some(position) => self.on_position(position, Utc::now()),
                    None => self.feed_lost(Feed::DronePosition),
                },
                event = next_message(&mut self.event_sub) => match event {
                    Some(event) => self.on_drone_event(event, Utc::now()),
                    None => self.feed_lost(Feed::DroneEvents),
                },
                Some(refresh) = self.refresh_rx.recv() => self.on_refresh(refresh, Utc::now()),
            }

            if self.finished() {
                break;
            }
        }

        self.close();
        self.metrics.sessions_active.dec();
    }

    fn on_tick(&mut self, now: DateTime<Utc>) {
        let outcome = self.reconciler.tick(now);
        self.metrics
            .position_ticks_total
            .with_label_values(&[outcome.source.as_str()])
            .inc();

        if let Some(transition) = outcome.transition {
            self.on_transition(transition);
        }
        self.publish(now);
    }

    fn on_position(&mut self, position: Coordinate, now: DateTime<Utc>) {
        if !position.is_valid() {
            warn!(order_id = %self.order_id, ?position, "ignoring invalid drone position");
            return;
        }

        self.metrics.realtime_positions_total.inc();
        self.last_drone_position = Some(position);
        if self.reconciler.apply_realtime(position, now) {
            self.publish(now);
        }
    }

    fn on_drone_event(&mut self, event: DroneEvent, now: DateTime<Utc>) {
        let Some(phase) = phase_for_event(event.event_type) else {
            debug!(order_id = %self.order_id, event = ?event.event_type, "ignoring drone event");
            return;
        };

        if let Some(position) = event.coordinate() {
            self.last_drone_position = Some(position);
        }
        if let Some(transition) = self.reconciler.sync_phase(phase, now) {
            self.on_transition(transition);
            self.publish(now);
        }
    }

    /// Partial updates are never trusted as-is: fields may be missing or
    /// arrive out of order, so the full document is re-fetched first.
    fn on_order_update(&self, update: OrderUpdate) {
        debug!(
            order_id = %self.order_id,
            status = ?update.status,
            drone_id = ?update.drone_id,
            "order update received; re-fetching"
        );

        let orders = self.collaborators.orders.clone();
        let refresh_tx = self.refresh_tx.clone();
        let order_id = self.order_id.clone();
        tokio::spawn(async move {
            match orders.get_order(&order_id).await {
                Ok(order) => {
                    let _ = refresh_tx.send(Refresh::Order(order)).await;
                }
                Err(err) => warn!(
                    order_id = %order_id,
                    error = %err,
                    "order re-fetch failed; keeping last state"
                ),
            }
        });
    }

    fn on_refresh(&mut self, refresh: Refresh, now: DateTime<Utc>) {
        match refresh {
            Refresh::Order(order) => self.apply_order(order, now),
            Refresh::Drone(drone_id, drone) => self.apply_drone(&drone_id, drone, now),
            Refresh::Waypoints(resolved) => {
                let current = *self.reconciler.waypoints();
                self.set_waypoints(Waypoints {
                    hub: current.hub.or(resolved.hub),
                    restaurant: current.restaurant.or(resolved.restaurant),
                    customer: current.customer.or(resolved.customer),
                });
            }
        }
        self.publish(now);
    }

    fn apply_order(&mut self, mut order: OrderRecord, now: DateTime<Utc>) {
        let previous_status = self.order.status;
        let previous_drone = self.order.drone_id.clone();
        order.status = merge_status(previous_status, order.status);
        self.order = order;

        if self.order.drone_id.is_some() && self.order.drone_id != previous_drone {
            self.last_drone_position = None;
            self.drone_pending = true;
            self.attach_drone();
        }

        let waypoints = self.reconciler.waypoints();
        if waypoints.restaurant.is_none() || waypoints.customer.is_none() {
            self.spawn_waypoint_resolution();
        }

        if self.order.status != previous_status {
            info!(
                order_id = %self.order_id,
                from = ?previous_status,
                to = ?self.order.status,
                "order status changed"
            );
            if self.order.status == OrderStatus::Cancelled {
                info!(
                    order_id = %self.order_id,
                    phase = %self.reconciler.phase(),
                    "order cancelled; holding phase"
                );
            } else if !self.drone_pending {
                self.apply_status(now);
            }
        }

        self.refresh_eta(now);
    }

    fn apply_drone(&mut self, drone_id: &str, drone: Option<DroneRecord>, now: DateTime<Utc>) {
        if self.order.drone_id.as_deref() != Some(drone_id) {
            debug!(order_id = %self.order_id, drone_id, "ignoring record of unassigned drone");
            return;
        }
        self.drone_pending = false;

        if let Some(drone) = drone {
            if self.last_drone_position.is_none() {
                self.last_drone_position = Some(drone.position());
            }

            // The departure point may only move before the drone has left.
            if let Some(hub) = drone.hub_coordinate() {
                let mut waypoints = *self.reconciler.waypoints();
                if self.reconciler.phase() == DeliveryPhase::Idle || waypoints.hub.is_none() {
                    waypoints.hub = Some(hub);
                    self.set_waypoints(waypoints);
                }
            }
        }

        if self.order.status != OrderStatus::Cancelled {
            self.apply_status(now);
        }
    }

    /// Moves the phase forward to whatever the order status (plus the last
    /// known drone position) implies.
    fn apply_status(&mut self, now: DateTime<Utc>) {
        let waypoints = *self.reconciler.waypoints();
        let target = infer_phase(
            self.order.status,
            self.last_drone_position.as_ref(),
            waypoints.hub.as_ref(),
            waypoints.restaurant.as_ref(),
        );

        if target <= self.reconciler.phase() {
            return;
        }
        if let Some(transition) = self.reconciler.resume(target, self.last_drone_position, now) {
            self.on_transition(transition);
        }
    }

    fn attach_drone(&mut self) {
        let Some(drone_id) = self.order.drone_id.clone() else {
            return;
        };

        info!(
            order_id = %self.order_id,
            drone_id = %drone_id,
            "drone assigned; following position"
        );
        self.position_sub = Some(self.collaborators.bus.subscribe_to_drone_position(&drone_id));

        let collaborators = self.collaborators.clone();
        let refresh_tx = self.refresh_tx.clone();
        tokio::spawn(async move {
            let drone = fetch_drone(&collaborators, &drone_id).await;
            let _ = refresh_tx.send(Refresh::Drone(drone_id, drone)).await;
        });
    }

    fn spawn_waypoint_resolution(&self) {
        let collaborators = self.collaborators.clone();
        let refresh_tx = self.refresh_tx.clone();
        let order = self.order.clone();
        let default_hub = self.config.default_hub;
        tokio::spawn(async move {
            let waypoints = resolve_waypoints(&collaborators, &order, None, default_hub).await;
            let _ = refresh_tx.send(Refresh::Waypoints(waypoints)).await;
        });
    }

    fn set_waypoints(&mut self, waypoints: Waypoints) {
        self.reconciler.set_waypoints(waypoints);
        if self.estimate.is_none() {
            self.estimate = estimate_between(&waypoints);
        }
    }

    fn on_transition(&mut self, transition: PhaseTransition) {
        info!(
            order_id = %self.order_id,
            from = %transition.from,
            to = %transition.to,
            "delivery phase changed"
        );
        self.metrics
            .phase_transitions_total
            .with_label_values(&[transition.to.as_str()])
            .inc();

        if transition.completed() {
            self.complete_delivery();
        }
    }

    /// Marks the order delivered and frees the drone. Both writes are
    /// fire-and-forget: failures are logged and the local state stays
    /// completed regardless. A cancelled order is never written.
    fn complete_delivery(&mut self) {
        if self.completion_requested || self.order.status == OrderStatus::Cancelled {
            return;
        }
        self.completion_requested = true;

        let mark_order = self.order.status != OrderStatus::Delivered;
        self.order.status = OrderStatus::Delivered;
        self.eta_minutes = Some(0.0);
        self.eta_active = false;

        let collaborators = self.collaborators.clone();
        let metrics = self.metrics.clone();
        let order_id = self.order_id.clone();
        let drone_id = self.order.drone_id.clone();
        tokio::spawn(async move {
            // The cancellation may not have reached this session yet.
            let stored = collaborators
                .orders
                .get_order(&order_id)
                .await
                .ok()
                .map(|order| order.status);
            if stored == Some(OrderStatus::Cancelled) {
                info!(order_id = %order_id, "order cancelled before completion; skipping writes");
                return;
            }

            if mark_order && stored != Some(OrderStatus::Delivered) {
                if let Err(err) = collaborators
                    .orders
                    .update_order_status(&order_id, OrderStatus::Delivered)
                    .await
                {
                    metrics
                        .side_effect_failures_total
                        .with_label_values(&["mark_delivered"])
                        .inc();
                    warn!(order_id = %order_id, error = %err, "failed to mark order delivered");
                }
            }

            if let Some(drone_id) = drone_id {
                if let Err(err) = collaborators
                    .drones
                    .update_drone(&drone_id, DroneUpdate::status(DroneStatus::Available))
                    .await
                {
                    metrics
                        .side_effect_failures_total
                        .with_label_values(&["release_drone"])
                        .inc();
                    warn!(
                        order_id = %order_id,
                        drone_id = %drone_id,
                        error = %err,
                        "failed to release drone"
                    );
                }
            }
        });
    }

    fn refresh_eta(&mut self, now: DateTime<Utc>) {
        self.eta_minutes = if self.completion_requested {
            Some(0.0)
        } else {
            eta_minutes(&self.order, self.estimate.as_ref(), now)
        };
        if self.order.status.is_terminal() {
            self.eta_active = false;
        }
        self.publish(now);
    }

    fn feed_lost(&mut self, feed: Feed) {
        warn!(
            order_id = %self.order_id,
            feed = feed.as_str(),
            "realtime feed closed; continuing without it"
        );
        match feed {
            Feed::Order => self.order_sub = None,
            Feed::DronePosition => self.position_sub = None,
            Feed::DroneEvents => self.event_sub = None,
        }
    }

    /// Nothing left to track once the delivery is done or the order is gone.
    fn finished(&self) -> bool {
        self.reconciler.phase() == DeliveryPhase::Completed
            || self.order.status == OrderStatus::Cancelled
    }

    fn publish(&self, now: DateTime<Utc>) {
        if let Some(snapshot_tx) = &self.snapshot_tx {
            snapshot_tx.send_replace(self.snapshot(now));
        }
    }

    fn snapshot(&self, now: DateTime<Utc>) -> SessionSnapshot {
        let waypoints = self.reconciler.waypoints();
        SessionSnapshot {
            order_id: self.order_id.clone(),
            drone_id: self.order.drone_id.clone(),
            order_status: self.order.status,
            phase: self.reconciler.phase(),
            phase_started_at: self.reconciler.phase_started_at(),
            phase_progress: self.reconciler.phase_progress(),
            overall_progress: self.reconciler.overall_progress(),
            drone_coord: self.reconciler.drone_coord(),
            path_history: self.reconciler.trail().to_vec(),
            hub: waypoints.hub,
            restaurant: waypoints.restaurant,
            customer: waypoints.customer,
            position_source: self.reconciler.last_source(),
            last_realtime_update_at: self.reconciler.last_realtime_at(),
            eta_minutes: self.eta_minutes,
            updated_at: now,
        }
    }

    fn close(&mut self) {
        if let Some(mut subscription) = self.order_sub.take() {
            subscription.unsubscribe();
        }
        if let Some(mut subscription) = self.position_sub.take() {
            subscription.unsubscribe();
        }
        if let Some(mut subscription) = self.event_sub.take() {
            subscription.unsubscribe();
        }
        self.refresh_rx.close();
        info!(
            order_id = %self.order_id,
            phase = %self.reconciler.phase(),
            "tracking session stopped"
        );
    }
}

/// Keeps terminal statuses and never moves back to an earlier stage. The two
/// in-flight statuses may replace each other.
fn merge_status(current: OrderStatus, incoming: OrderStatus) -> OrderStatus {
    if current.is_terminal() || incoming.rank() < current.rank() {
        current
    } else {
        incoming
    }
}

pub(crate) async fn next_message<T>(subscription: &mut Option<Subscription<T>>) -> Option<T> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn fetch_drone(
    collaborators: &Collaborators,
    drone_id: &str,
) -> Option<DroneRecord> {
    match collaborators.drones.get_drone(drone_id).await {
        Ok(drone) => Some(drone),
        Err(err) => {
            warn!(drone_id, error = %err, "drone fetch failed");
            None
        }
    }
}

/// Resolves hub, restaurant and customer coordinates. Each one that cannot be
/// resolved stays `None`; the reconciler treats that as pending.
pub(crate) async fn resolve_waypoints(
    collaborators: &Collaborators,
    order: &OrderRecord,
    drone: Option<&DroneRecord>,
    default_hub: Option<Coordinate>,
) -> Waypoints {
    let hub = drone.and_then(DroneRecord::hub_coordinate).or(default_hub);

    let restaurant = match order.restaurant_id.as_deref() {
        Some(restaurant_id) => match collaborators.restaurants.get_restaurant(restaurant_id).await {
            Ok(restaurant) => match restaurant.coordinate() {
                Some(coordinate) => Some(coordinate),
                None => geocode_or_none(collaborators, &restaurant.address).await,
            },
            Err(err) => {
                warn!(order_id = %order.id, restaurant_id, error = %err, "restaurant fetch failed");
                None
            }
        },
        None => None,
    };

    let customer = match order.delivery_coordinate() {
        Some(coordinate) => Some(coordinate),
        None => geocode_or_none(collaborators, &order.delivery_address).await,
    };

    Waypoints {
        hub,
        restaurant,
        customer,
    }
}

async fn geocode_or_none(collaborators: &Collaborators, address: &str) -> Option<Coordinate> {
    if address.trim().is_empty() {
        return None;
    }

    match collaborators.geocoder.geocode(address).await {
        Ok(coordinate) => Some(coordinate),
        Err(err) => {
            warn!(address, error = %err, "geocoding failed; waypoint pending");
            None
        }
    }
}

fn estimate_between(waypoints: &Waypoints) -> Option<DeliveryEstimate> {
    waypoints
        .restaurant
        .zip(waypoints.customer)
        .map(|(restaurant, customer)| estimate::calculate(&restaurant, &customer))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::engine::phase::PhaseDurations;
    use crate::models::restaurant::RestaurantRecord;
    use crate::models::session::PositionSource;
    use crate::store::RealtimeBus;
    use crate::store::memory::{MemoryBus, MemoryStore, StaticGeocoder};

    const HUB: Coordinate = Coordinate::new(10.7626, 106.6602);
    const RESTAURANT: Coordinate = Coordinate::new(10.7769, 106.7009);
    const CUSTOMER: Coordinate = Coordinate::new(10.75, 106.65);

    struct Backend {
        bus: Arc<MemoryBus>,
        store: Arc<MemoryStore>,
        controller: TrackingSessionController,
    }

    fn fast_durations() -> PhaseDurations {
        PhaseDurations {
            to_restaurant: Duration::from_millis(40),
            picking_up: Duration::from_millis(20),
            to_customer: Duration::from_millis(40),
            delivering: Duration::from_millis(20),
        }
    }

    /// Long enough that no phase ends while a test is looking at it.
    fn slow_durations() -> PhaseDurations {
        PhaseDurations {
            to_restaurant: Duration::from_secs(30),
            picking_up: Duration::from_secs(30),
            to_customer: Duration::from_secs(30),
            delivering: Duration::from_secs(30),
        }
    }

    fn backend() -> Backend {
        backend_with(fast_durations(), Duration::from_secs(30))
    }

    fn backend_with(phase_durations: PhaseDurations, eta_refresh: Duration) -> Backend {
        let bus = Arc::new(MemoryBus::new(64));
        let store = Arc::new(MemoryStore::new(bus.clone()));
        let geocoder = Arc::new(StaticGeocoder::new());
        geocoder.insert("12 Le Loi", CUSTOMER);

        let config = TrackingConfig {
            tick_interval: Duration::from_millis(10),
            freshness_window: Duration::from_millis(200),
            eta_refresh,
            phase_durations,
            default_hub: Some(HUB),
        };
        let controller = TrackingSessionController::new(
            Collaborators::in_memory(store.clone(), bus.clone(), geocoder),
            config,
            Metrics::new(),
        );

        store.put_restaurant(RestaurantRecord {
            id: "r1".to_string(),
            name: "Pho 24".to_string(),
            address: String::new(),
            latitude: Some(RESTAURANT.latitude),
            longitude: Some(RESTAURANT.longitude),
        });
        store.put_drone(drone_at(HUB));

        Backend {
            bus,
            store,
            controller,
        }
    }

    fn drone_at(position: Coordinate) -> DroneRecord {
        DroneRecord {
            id: "d1".to_string(),
            current_latitude: position.latitude,
            current_longitude: position.longitude,
            home_latitude: Some(HUB.latitude),
            home_longitude: Some(HUB.longitude),
            status: DroneStatus::Busy,
            hub_id: None,
            hub_location: None,
        }
    }

    fn order(status: OrderStatus, drone_id: Option<&str>) -> OrderRecord {
        OrderRecord {
            id: "o1".to_string(),
            status,
            drone_id: drone_id.map(str::to_string),
            restaurant_id: Some("r1".to_string()),
            delivery_address: "12 Le Loi".to_string(),
            delivery_latitude: None,
            delivery_longitude: None,
            estimated_delivery_time: None,
            assigned_at: None,
        }
    }

    async fn wait_until(
        handle: &TrackingHandle,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
            .await
            .expect("snapshot condition not reached in time")
            .expect("session stopped")
            .clone()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn start_requires_order_id() {
        let backend = backend();
        let err = backend.controller.start("   ").await.err().unwrap();
        assert!(matches!(err, AppError::MissingOrderId));
    }

    #[tokio::test]
    async fn start_fails_when_order_cannot_be_loaded() {
        let backend = backend();
        let err = backend.controller.start("missing").await.err().unwrap();
        assert!(matches!(err, AppError::OrderUnavailable(id) if id == "missing"));
        assert_eq!(backend.bus.order_subscribers("missing"), 0);
    }

    #[tokio::test]
    async fn resolves_waypoints_and_geocodes_customer() {
        let backend = backend();
        backend.store.put_order(order(OrderStatus::Preparing, None));

        let handle = backend.controller.start("o1").await.unwrap();
        let snapshot = handle.snapshot();

        assert_eq!(snapshot.phase, DeliveryPhase::Idle);
        assert_eq!(snapshot.hub, Some(HUB));
        assert_eq!(snapshot.restaurant, Some(RESTAURANT));
        assert_eq!(snapshot.customer, Some(CUSTOMER));
        assert_eq!(snapshot.drone_coord, Some(HUB));
        assert_eq!(snapshot.overall_progress, 0.0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn local_animation_completes_and_releases_drone() {
        let backend = backend();
        backend.store.put_order(order(OrderStatus::Delivering, Some("d1")));

        let handle = backend.controller.start("o1").await.unwrap();
        assert_eq!(handle.snapshot().phase, DeliveryPhase::ToRestaurant);

        let done = wait_until(&handle, |s| s.phase == DeliveryPhase::Completed).await;
        assert_eq!(done.overall_progress, 100.0);
        assert_eq!(done.order_status, OrderStatus::Delivered);
        assert_eq!(done.eta_minutes, Some(0.0));
        assert!(!done.path_history.is_empty());

        let store = backend.store.clone();
        eventually(move || {
            store.order("o1").map(|o| o.status) == Some(OrderStatus::Delivered)
                && store.drone("d1").map(|d| d.status) == Some(DroneStatus::Available)
        })
        .await;

        // A finished delivery lets go of its feeds without being stopped.
        let bus = backend.bus.clone();
        eventually(|| !handle.is_running()).await;
        eventually(move || bus.position_subscribers("d1") == 0 && bus.order_subscribers("o1") == 0)
            .await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn completion_survives_failed_writes() {
        let backend = backend();
        backend.store.put_order(order(OrderStatus::Delivering, Some("d1")));
        backend.store.set_fail_writes(true);

        let handle = backend.controller.start("o1").await.unwrap();
        let done = wait_until(&handle, |s| s.phase == DeliveryPhase::Completed).await;

        assert_eq!(done.order_status, OrderStatus::Delivered);
        assert_eq!(
            backend.store.order("o1").map(|o| o.status),
            Some(OrderStatus::Delivering)
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn realtime_position_overrides_local_animation() {
        let backend = backend_with(slow_durations(), Duration::from_secs(30));
        backend.store.put_order(order(OrderStatus::Delivering, Some("d1")));
        let handle = backend.controller.start("o1").await.unwrap();

        let remote = Coordinate::new(10.77, 106.68);
        backend.bus.publish_drone_position("d1", remote);

        let snapshot = wait_until(&handle, |s| s.drone_coord == Some(remote)).await;
        assert!(snapshot.last_realtime_update_at.is_some());

        let snapshot = wait_until(&handle, |s| s.position_source == PositionSource::Realtime).await;
        assert_eq!(snapshot.drone_coord, Some(remote));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn drone_assigned_after_start_departs_from_hub() {
        let backend = backend_with(slow_durations(), Duration::from_secs(30));
        backend.store.put_order(order(OrderStatus::Confirmed, None));
        let handle = backend.controller.start("o1").await.unwrap();
        assert_eq!(backend.bus.position_subscribers("d1"), 0);

        backend.store.put_order(order(OrderStatus::Delivering, Some("d1")));

        let snapshot = wait_until(&handle, |s| s.phase != DeliveryPhase::Idle).await;
        assert_eq!(snapshot.drone_id.as_deref(), Some("d1"));
        assert_eq!(snapshot.order_status, OrderStatus::Delivering);
        assert_eq!(snapshot.phase, DeliveryPhase::ToRestaurant);
        assert!(snapshot.overall_progress < 1.0);
        let coord = snapshot.drone_coord.unwrap();
        assert!((coord.latitude - HUB.latitude).abs() < 1e-3);
        assert!((coord.longitude - HUB.longitude).abs() < 1e-3);

        let bus = backend.bus.clone();
        eventually(move || bus.position_subscribers("d1") == 1).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn drone_event_jumps_phase_forward_only() {
        let backend = backend_with(slow_durations(), Duration::from_secs(30));
        backend.store.put_order(order(OrderStatus::Delivering, Some("d1")));
        let handle = backend.controller.start("o1").await.unwrap();

        backend.bus.publish_drone_event(
            "o1",
            DroneEvent::new(crate::models::drone::DroneEventType::PickedUp, None),
        );
        wait_until(&handle, |s| s.phase == DeliveryPhase::ToCustomer).await;

        backend.bus.publish_drone_event(
            "o1",
            DroneEvent::new(crate::models::drone::DroneEventType::DeliveryStarted, None),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handle.snapshot().phase, DeliveryPhase::ToCustomer);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stop_releases_every_subscription_once() {
        let backend = backend_with(slow_durations(), Duration::from_secs(30));
        backend.store.put_order(order(OrderStatus::Delivering, Some("d1")));
        let mut handle = backend.controller.start("o1").await.unwrap();
        assert_eq!(backend.bus.order_subscribers("o1"), 1);
        assert_eq!(backend.bus.event_subscribers("o1"), 1);
        assert_eq!(backend.bus.position_subscribers("d1"), 1);

        assert!(handle.stop());
        assert!(!handle.stop());
        handle.shutdown().await;

        assert_eq!(backend.bus.unsubscribe_count(), 3);
        assert_eq!(backend.bus.order_subscribers("o1"), 0);
        assert_eq!(backend.bus.event_subscribers("o1"), 0);
        assert_eq!(backend.bus.position_subscribers("d1"), 0);
    }

    #[tokio::test]
    async fn reconnect_near_restaurant_resumes_on_customer_leg() {
        let backend = backend();
        backend.store.put_drone(drone_at(Coordinate::new(10.7768, 106.7008)));
        backend.store.put_order(order(OrderStatus::PickedUp, Some("d1")));

        let handle = backend.controller.start("o1").await.unwrap();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.phase, DeliveryPhase::ToCustomer);
        assert!(snapshot.overall_progress >= 30.0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_order_holds_phase_and_is_never_delivered() {
        let backend = backend_with(slow_durations(), Duration::from_secs(30));
        backend.store.put_order(order(OrderStatus::Delivering, Some("d1")));
        let handle = backend.controller.start("o1").await.unwrap();
        assert_eq!(handle.snapshot().phase, DeliveryPhase::ToRestaurant);

        backend.store.put_order(order(OrderStatus::Cancelled, Some("d1")));

        let snapshot =
            wait_until(&handle, |s| s.order_status == OrderStatus::Cancelled).await;
        assert_eq!(snapshot.phase, DeliveryPhase::ToRestaurant);
        assert_eq!(snapshot.eta_minutes, None);

        eventually(|| !handle.is_running()).await;
        assert_eq!(backend.bus.order_subscribers("o1"), 0);
        assert_eq!(backend.bus.position_subscribers("d1"), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.snapshot().phase, DeliveryPhase::ToRestaurant);
        assert_eq!(
            backend.store.order("o1").map(|o| o.status),
            Some(OrderStatus::Cancelled)
        );
        assert_eq!(
            backend.store.drone("d1").map(|d| d.status),
            Some(DroneStatus::Busy)
        );
    }

    #[tokio::test]
    async fn failed_completion_writes_keep_delivered_state() {
        let backend = backend();
        backend.store.put_order(order(OrderStatus::Delivering, Some("d1")));
        backend.store.set_fail_writes(true);
        let handle = backend.controller.start("o1").await.unwrap();
        wait_until(&handle, |s| s.phase == DeliveryPhase::Completed).await;

        let mut later = order(OrderStatus::Delivering, Some("d1"));
        later.estimated_delivery_time = Some(Utc::now() + chrono::TimeDelta::minutes(10));
        backend.store.put_order(later);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.phase, DeliveryPhase::Completed);
        assert_eq!(snapshot.order_status, OrderStatus::Delivered);
        assert_eq!(snapshot.eta_minutes, Some(0.0));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stale_status_does_not_move_order_backward() {
        let backend = backend_with(slow_durations(), Duration::from_secs(30));
        backend.store.put_drone(drone_at(Coordinate::new(10.7768, 106.7008)));
        backend.store.put_order(order(OrderStatus::PickedUp, Some("d1")));
        let handle = backend.controller.start("o1").await.unwrap();

        let mut stale = order(OrderStatus::Ready, Some("d1"));
        stale.estimated_delivery_time = Some(Utc::now() + chrono::TimeDelta::minutes(7));
        backend.store.put_order(stale);

        let snapshot = wait_until(&handle, |s| s.eta_minutes.is_some()).await;
        assert_eq!(snapshot.order_status, OrderStatus::PickedUp);
        assert_eq!(snapshot.phase, DeliveryPhase::ToCustomer);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn eta_timer_counts_down_until_order_is_terminal() {
        let backend = backend_with(slow_durations(), Duration::from_millis(20));
        let mut record = order(OrderStatus::Preparing, None);
        record.estimated_delivery_time = Some(Utc::now() + chrono::TimeDelta::minutes(10));
        backend.store.put_order(record);
        let handle = backend.controller.start("o1").await.unwrap();

        let initial = handle.snapshot().eta_minutes.unwrap();
        assert!(initial > 9.9 && initial <= 10.0);
        let later = wait_until(&handle, |s| s.eta_minutes.is_some_and(|eta| eta < initial)).await;
        assert!(later.eta_minutes.unwrap() > 9.0);

        backend.store.put_order(order(OrderStatus::Cancelled, None));
        let snapshot =
            wait_until(&handle, |s| s.order_status == OrderStatus::Cancelled).await;
        assert_eq!(snapshot.eta_minutes, None);
        eventually(|| !handle.is_running()).await;
        assert_eq!(handle.snapshot().eta_minutes, None);
    }

    #[test]
    fn merged_status_keeps_terminal_and_forward_progress() {
        use OrderStatus::*;

        assert_eq!(merge_status(Ready, PickedUp), PickedUp);
        assert_eq!(merge_status(PickedUp, Ready), PickedUp);
        assert_eq!(merge_status(PickedUp, Delivering), Delivering);
        assert_eq!(merge_status(Delivering, PickedUp), PickedUp);
        assert_eq!(merge_status(Delivering, Cancelled), Cancelled);
        assert_eq!(merge_status(Delivered, Delivering), Delivered);
        assert_eq!(merge_status(Cancelled, Delivered), Cancelled);
    }
}
