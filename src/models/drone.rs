use serde::{Deserialize, Serialize};

use crate::models::coordinate::Coordinate;
use crate::models::reference::{HubDocument, Reference, resolve_reference};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DroneStatus {
    #[default]
    Available,
    Busy,
    Charging,
    Maintenance,
    Offline,
}

/// Drone document with its hub reference already normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "DroneDocument")]
pub struct DroneRecord {
    pub id: String,
    pub current_latitude: f64,
    pub current_longitude: f64,
    pub home_latitude: Option<f64>,
    pub home_longitude: Option<f64>,
    pub status: DroneStatus,
    pub hub_id: Option<String>,
    pub hub_location: Option<Coordinate>,
}

impl DroneRecord {
    pub fn position(&self) -> Coordinate {
        Coordinate::new(self.current_latitude, self.current_longitude)
    }

    /// Where the drone departs from: its home pad if set, else its hub.
    pub fn hub_coordinate(&self) -> Option<Coordinate> {
        Coordinate::from_parts(self.home_latitude, self.home_longitude).or(self.hub_location)
    }

    pub fn apply(&mut self, update: &DroneUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(latitude) = update.current_latitude {
            self.current_latitude = latitude;
        }
        if let Some(longitude) = update.current_longitude {
            self.current_longitude = longitude;
        }
    }
}

#[derive(Deserialize)]
struct DroneDocument {
    #[serde(default, alias = "_id")]
    id: String,
    current_latitude: f64,
    current_longitude: f64,
    #[serde(default)]
    home_latitude: Option<f64>,
    #[serde(default)]
    home_longitude: Option<f64>,
    #[serde(default)]
    status: DroneStatus,
    #[serde(default, alias = "hub_id")]
    hub: Option<Reference<HubDocument>>,
    #[serde(default)]
    hub_location: Option<Coordinate>,
}

impl From<DroneDocument> for DroneRecord {
    fn from(document: DroneDocument) -> Self {
        let embedded_location = document
            .hub
            .as_ref()
            .and_then(Reference::embedded)
            .and_then(HubDocument::coordinate);

        Self {
            id: document.id,
            current_latitude: document.current_latitude,
            current_longitude: document.current_longitude,
            home_latitude: document.home_latitude,
            home_longitude: document.home_longitude,
            status: document.status,
            hub_id: document.hub.as_ref().map(resolve_reference),
            hub_location: document.hub_location.or(embedded_location),
        }
    }
}

/// Partial drone write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DroneUpdate {
    #[serde(default)]
    pub status: Option<DroneStatus>,
    #[serde(default)]
    pub current_latitude: Option<f64>,
    #[serde(default)]
    pub current_longitude: Option<f64>,
}

impl DroneUpdate {
    pub fn status(status: DroneStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn position(position: Coordinate) -> Self {
        Self {
            current_latitude: Some(position.latitude),
            current_longitude: Some(position.longitude),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DroneEventType {
    DeliveryStarted,
    ArrivedAtRestaurant,
    PickedUp,
    ArrivedAtCustomer,
    Delivered,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroneEvent {
    pub event_type: DroneEventType,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl DroneEvent {
    pub fn new(event_type: DroneEventType, at: Option<Coordinate>) -> Self {
        Self {
            event_type,
            latitude: at.map(|c| c.latitude),
            longitude: at.map(|c| c.longitude),
        }
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        Coordinate::from_parts(self.latitude, self.longitude)
    }
}
