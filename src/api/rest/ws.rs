use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::subscription::SessionSubscriptions;
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Reconcile { topics: Vec<String> },
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel(256);
    let subs = Arc::new(SessionSubscriptions::new(
        state.bus.clone(),
        out_tx,
        state.metrics.clone(),
    ));

    info!("subscriber session connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize event for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let frame_subs = subs.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let frame: ClientFrame = match serde_json::from_str(&text) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "ignoring malformed client frame");
                    continue;
                }
            };

            let result = match frame {
                ClientFrame::Subscribe { topic } => frame_subs.subscribe(&topic).await,
                ClientFrame::Unsubscribe { topic } => {
                    frame_subs.unsubscribe(&topic).await;
                    Ok(())
                }
                ClientFrame::Reconcile { topics } => {
                    let desired: HashSet<String> = topics.into_iter().collect();
                    frame_subs.reconcile(&desired).await
                }
            };
            if let Err(err) = result {
                warn!(error = %err, "subscription change failed");
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    subs.teardown().await;
    info!("subscriber session disconnected");
}
