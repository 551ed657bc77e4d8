use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::chat::PostMessage;
use crate::error::AppError;
use crate::models::chat::{ChatMessage, ChatRole};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/orders/:id/messages",
            post(post_message).get(message_history),
        )
        .route("/orders/:id/messages/:message_id/read", post(mark_read))
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<PostMessage>,
) -> Result<Json<ChatMessage>, AppError> {
    let message = state.chat.post(id, payload).await?;
    Ok(Json(message))
}

async fn message_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ChatMessage>>, AppError> {
    let history = state.chat.history(id).await?;
    Ok(Json(history))
}

#[derive(Deserialize)]
struct MarkReadRequest {
    reader_role: ChatRole,
}

#[derive(Serialize)]
struct MarkReadResponse {
    updated: bool,
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path((id, message_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>, AppError> {
    let updated = state
        .chat
        .mark_read(id, message_id, payload.reader_role)
        .await?;
    Ok(Json(MarkReadResponse { updated }))
}
