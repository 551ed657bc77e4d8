use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::orders::{ProposeRequest, RespondDecision};
use crate::engine::settlement::CompletionOutcome;
use crate::error::AppError;
use crate::models::order::{Order, OrderStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(propose_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/respond", post(respond))
        .route("/orders/:id/advance", post(advance))
        .route("/orders/:id/complete", post(complete))
}

async fn propose_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ProposeRequest>,
) -> Result<Json<Order>, AppError> {
    let order = state.orders.propose(payload).await?;
    Ok(Json(order))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let order = state.store.order(id).await?;
    Ok(Json(order))
}

#[derive(Deserialize)]
struct RespondRequest {
    driver_id: Uuid,
    decision: RespondDecision,
}

async fn respond(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RespondRequest>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .orders
        .respond(id, payload.driver_id, payload.decision)
        .await?;
    Ok(Json(order))
}

#[derive(Deserialize)]
struct AdvanceRequest {
    actor_id: Uuid,
    next: OrderStatus,
}

async fn advance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AdvanceRequest>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .orders
        .advance(id, payload.actor_id, payload.next)
        .await?;
    Ok(Json(order))
}

#[derive(Deserialize)]
struct CompleteRequest {
    driver_id: Uuid,
    proof_image: Option<String>,
}

async fn complete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CompleteRequest>,
) -> Result<Json<CompletionOutcome>, AppError> {
    let outcome = state
        .settlement
        .complete(id, payload.driver_id, payload.proof_image)
        .await?;
    Ok(Json(outcome))
}
