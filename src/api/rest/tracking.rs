use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use tracing::info;

use crate::api::rest::ws;
use crate::error::AppError;
use crate::models::session::SessionSnapshot;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/tracking/:order_id",
            post(start_tracking).get(get_tracking).delete(stop_tracking),
        )
        .route("/tracking/:order_id/ws", get(ws::tracking_ws))
}

async fn start_tracking(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<(StatusCode, Json<SessionSnapshot>), AppError> {
    if let Some(handle) = state.sessions.get(&order_id) {
        if handle.is_running() {
            return Ok((StatusCode::OK, Json(handle.snapshot())));
        }
    }

    let handle = state.controller.start(&order_id).await?;
    let snapshot = handle.snapshot();
    state.sessions.insert(order_id, handle);

    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_tracking(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let handle = state
        .sessions
        .get(&order_id)
        .ok_or_else(|| AppError::NotFound(format!("no tracking session for order {order_id}")))?;

    Ok(Json(handle.snapshot()))
}

async fn stop_tracking(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let (_, handle) = state
        .sessions
        .remove(&order_id)
        .ok_or_else(|| AppError::NotFound(format!("no tracking session for order {order_id}")))?;

    handle.shutdown().await;
    info!(order_id = %order_id, "tracking session removed");

    Ok(StatusCode::NO_CONTENT)
}
