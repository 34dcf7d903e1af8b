use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Deserialize;

use crate::engine::estimate::{self, DeliveryEstimate};
use crate::error::AppError;
use crate::models::coordinate::Coordinate;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/estimates", post(create_estimate))
}

/// Either a customer coordinate or a free-form address to geocode.
#[derive(Deserialize)]
pub struct EstimateRequest {
    pub restaurant: Coordinate,
    #[serde(default)]
    pub customer: Option<Coordinate>,
    #[serde(default)]
    pub address: Option<String>,
}

async fn create_estimate(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EstimateRequest>,
) -> Result<Json<DeliveryEstimate>, AppError> {
    if !payload.restaurant.is_valid() {
        return Err(AppError::BadRequest("invalid restaurant coordinate".to_string()));
    }

    let estimate = match (payload.customer, payload.address) {
        (Some(customer), _) if customer.is_valid() => {
            estimate::calculate(&payload.restaurant, &customer)
        }
        (Some(_), _) => {
            return Err(AppError::BadRequest("invalid customer coordinate".to_string()));
        }
        (None, Some(address)) => {
            estimate::calculate_from_address(state.geocoder.as_ref(), &payload.restaurant, &address)
                .await
        }
        (None, None) => {
            return Err(AppError::BadRequest(
                "either customer or address is required".to_string(),
            ));
        }
    };

    Ok(Json(estimate))
}
