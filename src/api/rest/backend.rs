//! Write side of the in-memory backend. These routes stand in for the hosted
//! document store: seeding records, status changes and authoritative drone
//! positions all fan out over the realtime bus like a change feed would.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post, put};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::AppError;
use crate::models::coordinate::Coordinate;
use crate::models::drone::{DroneRecord, DroneUpdate};
use crate::models::order::{OrderRecord, OrderStatus};
use crate::models::restaurant::RestaurantRecord;
use crate::state::AppState;
use crate::store::{DroneStore, OrderStore};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders/:id", put(put_order).get(get_order))
        .route("/orders/:id/status", patch(update_order_status))
        .route("/orders/:id/simulate", post(simulate_delivery))
        .route("/drones/:id", put(put_drone).get(get_drone))
        .route("/drones/:id/position", post(push_drone_position))
        .route("/restaurants/:id", put(put_restaurant))
        .route("/geocoder/addresses", put(put_addresses))
}

async fn put_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut order): Json<OrderRecord>,
) -> Json<OrderRecord> {
    order.id = id;
    state.store.put_order(order.clone());
    Json(order)
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OrderRecord>, AppError> {
    Ok(Json(state.store.get_order(&id).await?))
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: OrderStatus,
}

async fn update_order_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<StatusRequest>,
) -> Result<Json<OrderRecord>, AppError> {
    state.store.update_order_status(&id, payload.status).await?;
    Ok(Json(state.store.get_order(&id).await?))
}

async fn put_drone(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut drone): Json<DroneRecord>,
) -> Json<DroneRecord> {
    drone.id = id;
    state.store.put_drone(drone.clone());
    Json(drone)
}

async fn get_drone(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DroneRecord>, AppError> {
    Ok(Json(state.store.get_drone(&id).await?))
}

async fn push_drone_position(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(position): Json<Coordinate>,
) -> Result<Json<DroneRecord>, AppError> {
    if !position.is_valid() {
        return Err(AppError::BadRequest(format!(
            "invalid position ({}, {})",
            position.latitude, position.longitude
        )));
    }

    state
        .store
        .update_drone(&id, DroneUpdate::position(position))
        .await?;
    Ok(Json(state.store.get_drone(&id).await?))
}

async fn put_restaurant(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut restaurant): Json<RestaurantRecord>,
) -> Json<RestaurantRecord> {
    restaurant.id = id;
    state.store.put_restaurant(restaurant.clone());
    Json(restaurant)
}

#[derive(Deserialize)]
pub struct AddressEntry {
    pub address: String,
    #[serde(flatten)]
    pub coordinate: Coordinate,
}

#[derive(Serialize)]
pub struct AddressesResponse {
    pub count: usize,
}

async fn put_addresses(
    State(state): State<Arc<AppState>>,
    Json(entries): Json<Vec<AddressEntry>>,
) -> Result<Json<AddressesResponse>, AppError> {
    if let Some(entry) = entries.iter().find(|entry| entry.address.trim().is_empty()) {
        return Err(AppError::BadRequest(format!(
            "empty address for ({}, {})",
            entry.coordinate.latitude, entry.coordinate.longitude
        )));
    }

    for entry in &entries {
        state.geocoder.insert(&entry.address, entry.coordinate);
    }

    Ok(Json(AddressesResponse {
        count: state.geocoder.len(),
    }))
}

#[derive(Serialize)]
pub struct SimulationResponse {
    pub order_id: String,
    pub status: &'static str,
}

async fn simulate_delivery(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<SimulationResponse>), AppError> {
    state.simulations.retain(|_, handle| handle.is_running());
    if state.simulations.contains_key(&id) {
        return Err(AppError::Conflict(format!(
            "order {id} is already being simulated"
        )));
    }

    let handle = state.simulator.launch(&id).await?;
    state.simulations.insert(id.clone(), handle);
    info!(order_id = %id, "simulation accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(SimulationResponse {
            order_id: id,
            status: "simulating",
        }),
    ))
}
