use std::sync::Arc;

use dashmap::DashMap;

use crate::config::TrackingConfig;
use crate::engine::phase::DurationPreset;
use crate::engine::session::{TrackingHandle, TrackingSessionController};
use crate::engine::simulator::{DroneSimulator, SimulationHandle};
use crate::observability::metrics::Metrics;
use crate::store::Collaborators;
use crate::store::memory::{MemoryBus, MemoryStore, StaticGeocoder};

pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub bus: Arc<MemoryBus>,
    pub geocoder: Arc<StaticGeocoder>,
    pub controller: TrackingSessionController,
    pub simulator: DroneSimulator,
    pub sessions: DashMap<String, TrackingHandle>,
    pub simulations: DashMap<String, SimulationHandle>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(tracking: TrackingConfig, event_buffer_size: usize) -> Self {
        let metrics = Metrics::new();
        let bus = Arc::new(MemoryBus::new(event_buffer_size));
        let store = Arc::new(MemoryStore::new(bus.clone()));
        let geocoder = Arc::new(StaticGeocoder::new());
        let collaborators = Collaborators::in_memory(store.clone(), bus.clone(), geocoder.clone());

        let simulator = DroneSimulator::new(
            collaborators.clone(),
            tracking.tick_interval,
            DurationPreset::AdminSimulator.durations(),
            tracking.default_hub,
            metrics.clone(),
        );
        let controller = TrackingSessionController::new(collaborators, tracking, metrics.clone());

        Self {
            store,
            bus,
            geocoder,
            controller,
            simulator,
            sessions: DashMap::new(),
            simulations: DashMap::new(),
            metrics,
        }
    }

    /// Swaps in the simulator used by `/orders/:id/simulate`.
    pub fn with_simulator(mut self, simulator: DroneSimulator) -> Self {
        self.simulator = simulator;
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::in_memory(self.store.clone(), self.bus.clone(), self.geocoder.clone())
    }
}
