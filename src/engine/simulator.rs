use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::engine::phase::{PhaseDurations, event_for_phase};
use crate::engine::reconciler::PositionReconciler;
use crate::engine::session::{fetch_drone, next_message, resolve_waypoints};
use crate::error::AppError;
use crate::models::coordinate::Coordinate;
use crate::models::drone::{DroneEvent, DroneStatus, DroneUpdate};
use crate::models::order::{OrderStatus, OrderUpdate};
use crate::models::session::DeliveryPhase;
use crate::observability::metrics::Metrics;
use crate::store::{Collaborators, Subscription};

/// Flies a drone through a whole delivery, writing its position to the drone
/// store on every tick. This is the authoritative source tracking sessions
/// consume over the realtime bus.
#[derive(Clone)]
pub struct DroneSimulator {
    collaborators: Collaborators,
    tick_interval: Duration,
    durations: PhaseDurations,
    default_hub: Option<Coordinate>,
    metrics: Metrics,
}

impl DroneSimulator {
    pub fn new(
        collaborators: Collaborators,
        tick_interval: Duration,
        durations: PhaseDurations,
        default_hub: Option<Coordinate>,
        metrics: Metrics,
    ) -> Self {
        Self {
            collaborators,
            tick_interval,
            durations,
            default_hub,
            metrics,
        }
    }

    pub async fn launch(&self, order_id: &str) -> Result<SimulationHandle, AppError> {
        let order = self.collaborators.orders.get_order(order_id).await?;
        if order.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "order {order_id} is already {:?}",
                order.status
            )));
        }

        let drone_id = order.drone_id.clone().ok_or_else(|| {
            AppError::BadRequest(format!("order {order_id} has no drone assigned"))
        })?;
        let drone = fetch_drone(&self.collaborators, &drone_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("drone {drone_id} not found")))?;

        let waypoints =
            resolve_waypoints(&self.collaborators, &order, Some(&drone), self.default_hub).await;
        if waypoints.hub.is_none() || waypoints.restaurant.is_none() || waypoints.customer.is_none()
        {
            return Err(AppError::BadRequest(format!(
                "order {order_id} has unresolved waypoints"
            )));
        }

        if !order.status.is_in_flight() {
            self.collaborators
                .orders
                .update_order_status(order_id, OrderStatus::Delivering)
                .await?;
        }
        self.collaborators
            .drones
            .update_drone(&drone_id, DroneUpdate::status(DroneStatus::Busy))
            .await?;

        let now = Utc::now();
        let mut reconciler =
            PositionReconciler::new(self.durations, self.tick_interval, Duration::ZERO, now);
        reconciler.set_waypoints(waypoints);
        reconciler.sync_phase(DeliveryPhase::ToRestaurant, now);

        let flight = Flight {
            order_id: order_id.to_string(),
            drone_id,
            reconciler,
            order_sub: Some(self.collaborators.bus.subscribe_to_order(order_id)),
            collaborators: self.collaborators.clone(),
            tick_interval: self.tick_interval,
            metrics: self.metrics.clone(),
        };
        flight.announce(DeliveryPhase::ToRestaurant);

        info!(order_id, drone_id = %flight.drone_id, "drone simulation launched");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(flight.run(shutdown_rx));

        Ok(SimulationHandle {
            order_id: order_id.to_string(),
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }
}

pub struct SimulationHandle {
    order_id: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SimulationHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&mut self) -> bool {
        match self.shutdown_tx.take() {
            Some(shutdown) => {
                let _ = shutdown.send(());
                debug!(order_id = %self.order_id, "simulation stop requested");
                true
            }
            None => false,
        }
    }
}

impl Drop for SimulationHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Flight {
    order_id: String,
    drone_id: String,
    reconciler: PositionReconciler,
    order_sub: Option<Subscription<OrderUpdate>>,
    collaborators: Collaborators,
    tick_interval: Duration,
    metrics: Metrics,
}

impl Flight {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(
                        order_id = %self.order_id,
                        phase = %self.reconciler.phase(),
                        "drone simulation stopped"
                    );
                    return;
                }
                _ = ticker.tick() => {
                    if self.step().await {
                        break;
                    }
                }
                update = next_message(&mut self.order_sub) => match update {
                    Some(update) if update.status == Some(OrderStatus::Cancelled) => {
                        if self.cancelled().await {
                            self.abort().await;
                            return;
                        }
                    }
                    Some(_) => {}
                    None => self.order_sub = None,
                },
            }
        }

        self.land().await;
    }

    /// Confirms a cancellation hint against the stored order.
    async fn cancelled(&self) -> bool {
        match self.collaborators.orders.get_order(&self.order_id).await {
            Ok(order) => order.status == OrderStatus::Cancelled,
            Err(err) => {
                warn!(order_id = %self.order_id, error = %err, "simulator order fetch failed");
                false
            }
        }
    }

    async fn abort(&self) {
        info!(
            order_id = %self.order_id,
            phase = %self.reconciler.phase(),
            "order cancelled; grounding drone"
        );
        self.release_drone().await;
    }

    /// One simulated second. Returns `true` once the delivery is complete.
    async fn step(&mut self) -> bool {
        let outcome = self.reconciler.tick(Utc::now());

        if let Some(position) = self.reconciler.drone_coord() {
            if let Err(err) = self
                .collaborators
                .drones
                .update_drone(&self.drone_id, DroneUpdate::position(position))
                .await
            {
                self.metrics
                    .side_effect_failures_total
                    .with_label_values(&["simulate_position"])
                    .inc();
                warn!(
                    drone_id = %self.drone_id,
                    error = %err,
                    "failed to write simulated position"
                );
            }
        }

        match outcome.transition {
            Some(transition) => {
                debug!(
                    order_id = %self.order_id,
                    from = %transition.from,
                    to = %transition.to,
                    "simulated phase change"
                );
                self.announce(transition.to);
                transition.completed()
            }
            None => false,
        }
    }

    fn announce(&self, phase: DeliveryPhase) {
        if let Some(event_type) = event_for_phase(phase) {
            let event = DroneEvent::new(event_type, self.reconciler.drone_coord());
            self.collaborators
                .bus
                .publish_drone_event(&self.order_id, event);
        }
    }

    async fn land(&self) {
        if self.cancelled().await {
            self.abort().await;
            return;
        }

        if let Err(err) = self
            .collaborators
            .orders
            .update_order_status(&self.order_id, OrderStatus::Delivered)
            .await
        {
            self.metrics
                .side_effect_failures_total
                .with_label_values(&["mark_delivered"])
                .inc();
            warn!(
                order_id = %self.order_id,
                error = %err,
                "simulator failed to mark order delivered"
            );
        }

        self.release_drone().await;
        info!(order_id = %self.order_id, drone_id = %self.drone_id, "drone simulation finished");
    }

    async fn release_drone(&self) {
        if let Err(err) = self
            .collaborators
            .drones
            .update_drone(&self.drone_id, DroneUpdate::status(DroneStatus::Available))
            .await
        {
            self.metrics
                .side_effect_failures_total
                .with_label_values(&["release_drone"])
                .inc();
            warn!(drone_id = %self.drone_id, error = %err, "simulator failed to release drone");
        }
    }
}
