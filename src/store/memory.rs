use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::coordinate::Coordinate;
use crate::models::drone::{DroneEvent, DroneRecord, DroneUpdate};
use crate::models::order::{OrderRecord, OrderStatus, OrderUpdate};
use crate::models::restaurant::RestaurantRecord;
use crate::store::{
    DroneStore, Geocoder, OrderStore, RealtimeBus, RestaurantStore, Subscription,
};

const REVERSE_GEOCODE_RADIUS_KM: f64 = 0.05;

type Subscribers<T> = Arc<DashMap<String, Vec<(Uuid, mpsc::Sender<T>)>>>;

/// Keyed fan-out of one message type.
struct Topic<T> {
    name: &'static str,
    subscribers: Subscribers<T>,
    buffer: usize,
    unsubscribed: Arc<AtomicUsize>,
}

impl<T: Clone + Send + 'static> Topic<T> {
    fn new(name: &'static str, buffer: usize, unsubscribed: Arc<AtomicUsize>) -> Self {
        Self {
            name,
            subscribers: Arc::new(DashMap::new()),
            buffer: buffer.max(1),
            unsubscribed,
        }
    }

    fn subscribe(&self, key: &str) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        self.subscribers
            .entry(key.to_string())
            .or_default()
            .push((id, tx));

        let subscribers = self.subscribers.clone();
        let unsubscribed = self.unsubscribed.clone();
        let key = key.to_string();
        let topic = self.name;

        Subscription::new(rx, move || {
            let emptied = match subscribers.get_mut(&key) {
                Some(mut entry) => {
                    entry.retain(|(subscriber, _)| *subscriber != id);
                    entry.is_empty()
                }
                None => false,
            };
            if emptied {
                subscribers.remove_if(&key, |_, entry| entry.is_empty());
            }

            unsubscribed.fetch_add(1, Ordering::SeqCst);
            debug!(topic, key = %key, "realtime subscription closed");
        })
    }

    /// Delivers to every live subscriber of `key`. Full buffers drop the
    /// message for that subscriber; closed ones are pruned.
    fn publish(&self, key: &str, message: T) -> usize {
        let Some(mut entry) = self.subscribers.get_mut(key) else {
            return 0;
        };

        entry.retain(|(_, tx)| match tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic = self.name, key, "subscriber lagging; dropping message");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        entry.len()
    }

    fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers.get(key).map(|entry| entry.len()).unwrap_or(0)
    }
}

/// In-process realtime bus.
pub struct MemoryBus {
    orders: Topic<OrderUpdate>,
    positions: Topic<Coordinate>,
    drone_events: Topic<DroneEvent>,
    unsubscribed: Arc<AtomicUsize>,
}

impl MemoryBus {
    pub fn new(buffer: usize) -> Self {
        let unsubscribed = Arc::new(AtomicUsize::new(0));
        Self {
            orders: Topic::new("orders", buffer, unsubscribed.clone()),
            positions: Topic::new("drone_positions", buffer, unsubscribed.clone()),
            drone_events: Topic::new("drone_events", buffer, unsubscribed.clone()),
            unsubscribed,
        }
    }

    pub fn publish_order_update(&self, order_id: &str, update: OrderUpdate) -> usize {
        self.orders.publish(order_id, update)
    }

    pub fn publish_drone_position(&self, drone_id: &str, position: Coordinate) -> usize {
        self.positions.publish(drone_id, position)
    }

    pub fn order_subscribers(&self, order_id: &str) -> usize {
        self.orders.subscriber_count(order_id)
    }

    pub fn position_subscribers(&self, drone_id: &str) -> usize {
        self.positions.subscriber_count(drone_id)
    }

    pub fn event_subscribers(&self, order_id: &str) -> usize {
        self.drone_events.subscriber_count(order_id)
    }

    /// Total number of subscriptions ever detached.
    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribed.load(Ordering::SeqCst)
    }
}

impl RealtimeBus for MemoryBus {
    fn subscribe_to_order(&self, order_id: &str) -> Subscription<OrderUpdate> {
        self.orders.subscribe(order_id)
    }

    fn subscribe_to_drone_position(&self, drone_id: &str) -> Subscription<Coordinate> {
        self.positions.subscribe(drone_id)
    }

    fn subscribe_to_drone_events(&self, order_id: &str) -> Subscription<DroneEvent> {
        self.drone_events.subscribe(order_id)
    }

    fn publish_drone_event(&self, order_id: &str, event: DroneEvent) -> usize {
        self.drone_events.publish(order_id, event)
    }
}

/// Document store backed by `DashMap`s. Writes fan out on the attached bus the
/// way a hosted backend's change feed would.
pub struct MemoryStore {
    orders: DashMap<String, OrderRecord>,
    drones: DashMap<String, DroneRecord>,
    restaurants: DashMap<String, RestaurantRecord>,
    bus: Arc<MemoryBus>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new(bus: Arc<MemoryBus>) -> Self {
        Self {
            orders: DashMap::new(),
            drones: DashMap::new(),
            restaurants: DashMap::new(),
            bus,
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn put_order(&self, order: OrderRecord) {
        let update = OrderUpdate {
            status: Some(order.status),
            drone_id: order.drone_id.clone(),
            estimated_delivery_time: order.estimated_delivery_time,
        };
        let id = order.id.clone();
        self.orders.insert(id.clone(), order);
        self.bus.publish_order_update(&id, update);
    }

    pub fn put_drone(&self, drone: DroneRecord) {
        let id = drone.id.clone();
        let position = drone.position();
        self.drones.insert(id.clone(), drone);
        self.bus.publish_drone_position(&id, position);
    }

    pub fn put_restaurant(&self, restaurant: RestaurantRecord) {
        self.restaurants.insert(restaurant.id.clone(), restaurant);
    }

    pub fn order(&self, order_id: &str) -> Option<OrderRecord> {
        self.orders.get(order_id).map(|entry| entry.value().clone())
    }

    pub fn drone(&self, drone_id: &str) -> Option<DroneRecord> {
        self.drones.get(drone_id).map(|entry| entry.value().clone())
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn drone_count(&self) -> usize {
        self.drones.len()
    }

    pub fn restaurant_count(&self) -> usize {
        self.restaurants.len()
    }

    /// Makes every write fail, to exercise best-effort paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), AppError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Unavailable("store rejected write".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn get_order(&self, order_id: &str) -> Result<OrderRecord, AppError> {
        self.order(order_id)
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
    }

    async fn update_order_status(
        &self,
        order_id: &str,
        status: OrderStatus,
    ) -> Result<(), AppError> {
        self.check_writable()?;

        let update = {
            let mut order = self
                .orders
                .get_mut(order_id)
                .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))?;
            order.status = status;
            OrderUpdate {
                status: Some(status),
                drone_id: order.drone_id.clone(),
                estimated_delivery_time: order.estimated_delivery_time,
            }
        };

        self.bus.publish_order_update(order_id, update);
        Ok(())
    }
}

#[async_trait]
impl DroneStore for MemoryStore {
    async fn get_drone(&self, drone_id: &str) -> Result<DroneRecord, AppError> {
        self.drone(drone_id)
            .ok_or_else(|| AppError::NotFound(format!("drone {drone_id} not found")))
    }

    async fn update_drone(&self, drone_id: &str, update: DroneUpdate) -> Result<(), AppError> {
        self.check_writable()?;

        let moved_to = {
            let mut drone = self
                .drones
                .get_mut(drone_id)
                .ok_or_else(|| AppError::NotFound(format!("drone {drone_id} not found")))?;
            drone.apply(&update);
            (update.current_latitude.is_some() || update.current_longitude.is_some())
                .then(|| drone.position())
        };

        if let Some(position) = moved_to {
            self.bus.publish_drone_position(drone_id, position);
        }
        Ok(())
    }
}

#[async_trait]
impl RestaurantStore for MemoryStore {
    async fn get_restaurant(&self, restaurant_id: &str) -> Result<RestaurantRecord, AppError> {
        self.restaurants
            .get(restaurant_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("restaurant {restaurant_id} not found")))
    }
}

/// Address book geocoder.
#[derive(Default)]
pub struct StaticGeocoder {
    entries: DashMap<String, (String, Coordinate)>,
}

impl StaticGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, address: &str, coordinate: Coordinate) {
        self.entries
            .insert(normalize_address(address), (address.trim().to_string(), coordinate));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Geocoder for StaticGeocoder {
    async fn geocode(&self, address: &str) -> Result<Coordinate, AppError> {
        let key = normalize_address(address);
        if key.is_empty() {
            return Err(AppError::Geocoding("empty address".to_string()));
        }

        self.entries
            .get(&key)
            .map(|entry| entry.value().1)
            .ok_or_else(|| AppError::Geocoding(format!("no match for '{}'", address.trim())))
    }

    async fn reverse_geocode(&self, coordinate: &Coordinate) -> Result<String, AppError> {
        self.entries
            .iter()
            .map(|entry| {
                let (address, point) = entry.value();
                (haversine_km(point, coordinate), address.clone())
            })
            .filter(|(distance, _)| *distance <= REVERSE_GEOCODE_RADIUS_KM)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, address)| address)
            .ok_or_else(|| {
                AppError::Geocoding(format!(
                    "no address near {:.5},{:.5}",
                    coordinate.latitude, coordinate.longitude
                ))
            })
    }
}

fn normalize_address(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
