use std::sync::Arc;

use drone_tracking::api;
use drone_tracking::config::Config;
use drone_tracking::error::AppError;
use drone_tracking::state::AppState;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let tracking = config.tracking();
    tracing::info!(
        tick_ms = tracking.tick_interval.as_millis() as u64,
        freshness_ms = tracking.freshness_window.as_millis() as u64,
        preset = ?config.phase_preset,
        "tracking configured"
    );

    let shared_state = Arc::new(AppState::new(tracking, config.event_buffer_size));
    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    let sessions: Vec<String> = shared_state
        .sessions
        .iter()
        .map(|entry| entry.key().clone())
        .collect();
    for order_id in sessions {
        if let Some((_, handle)) = shared_state.sessions.remove(&order_id) {
            handle.shutdown().await;
        }
    }
    shared_state.simulations.clear();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
