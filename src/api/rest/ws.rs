use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{info, warn};

use crate::error::AppError;
use crate::models::session::SessionSnapshot;
use crate::state::AppState;

pub async fn tracking_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let snapshots = state
        .sessions
        .get(&order_id)
        .map(|handle| handle.subscribe())
        .ok_or_else(|| AppError::NotFound(format!("no tracking session for order {order_id}")))?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, snapshots, order_id)))
}

async fn handle_socket(
    socket: WebSocket,
    snapshots: watch::Receiver<SessionSnapshot>,
    order_id: String,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut updates = WatchStream::new(snapshots);

    info!(order_id = %order_id, "websocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(snapshot) = updates.next().await {
            let json = match serde_json::to_string(&snapshot) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize snapshot for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!(order_id = %order_id, "websocket client disconnected");
}
