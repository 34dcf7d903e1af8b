//! Boundary to the hosted backend: document stores, realtime bus and
//! geocoding. Everything behind these traits is an external collaborator;
//! `memory` provides the in-process implementations used by the binary and
//! the tests.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::models::coordinate::Coordinate;
use crate::models::drone::{DroneEvent, DroneRecord, DroneUpdate};
use crate::models::order::{OrderRecord, OrderStatus, OrderUpdate};
use crate::models::restaurant::RestaurantRecord;

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get_order(&self, order_id: &str) -> Result<OrderRecord, AppError>;
    async fn update_order_status(&self, order_id: &str, status: OrderStatus)
    -> Result<(), AppError>;
}

#[async_trait]
pub trait DroneStore: Send + Sync {
    async fn get_drone(&self, drone_id: &str) -> Result<DroneRecord, AppError>;
    async fn update_drone(&self, drone_id: &str, update: DroneUpdate) -> Result<(), AppError>;
}

#[async_trait]
pub trait RestaurantStore: Send + Sync {
    async fn get_restaurant(&self, restaurant_id: &str) -> Result<RestaurantRecord, AppError>;
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<Coordinate, AppError>;
    async fn reverse_geocode(&self, coordinate: &Coordinate) -> Result<String, AppError>;
}

pub trait RealtimeBus: Send + Sync {
    fn subscribe_to_order(&self, order_id: &str) -> Subscription<OrderUpdate>;
    fn subscribe_to_drone_position(&self, drone_id: &str) -> Subscription<Coordinate>;
    fn subscribe_to_drone_events(&self, order_id: &str) -> Subscription<DroneEvent>;
    /// Announces a drone event for an order; returns how many listeners got it.
    fn publish_drone_event(&self, order_id: &str, event: DroneEvent) -> usize;
}

/// A live realtime feed. Dropping it, or calling [`Subscription::unsubscribe`],
/// detaches it from the bus exactly once.
pub struct Subscription<T> {
    receiver: mpsc::Receiver<T>,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T> Subscription<T> {
    pub fn new(
        receiver: mpsc::Receiver<T>,
        cancel: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            receiver,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Next message; `None` once the feed is closed or unsubscribed.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.receiver.close();
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    /// `true` when nothing is queued right now.
    pub fn receiver_is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Everything a tracking session talks to, injected at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub orders: Arc<dyn OrderStore>,
    pub drones: Arc<dyn DroneStore>,
    pub restaurants: Arc<dyn RestaurantStore>,
    pub bus: Arc<dyn RealtimeBus>,
    pub geocoder: Arc<dyn Geocoder>,
}

impl Collaborators {
    /// Wires every collaborator to the same in-memory backend.
    pub fn in_memory(
        store: Arc<memory::MemoryStore>,
        bus: Arc<memory::MemoryBus>,
        geocoder: Arc<memory::StaticGeocoder>,
    ) -> Self {
        Self {
            orders: store.clone(),
            drones: store.clone(),
            restaurants: store,
            bus,
            geocoder,
        }
    }
}
