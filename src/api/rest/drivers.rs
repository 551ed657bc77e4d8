use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::location::{ReportOutcome, SampleInput};
use crate::error::AppError;
use crate::models::driver::{Driver, DriverStatus};
use crate::models::wallet::WalletLedgerEntry;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", post(register_driver).get(list_drivers))
        .route("/drivers/:id/status", patch(update_status))
        .route("/drivers/:id/location", patch(report_location))
        .route("/drivers/:id/wallet", get(get_wallet))
        .route("/drivers/:id/wallet/topup", post(top_up))
}

#[derive(Deserialize)]
struct RegisterDriverRequest {
    name: String,
}

async fn register_driver(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterDriverRequest>,
) -> Result<Json<Driver>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }

    let driver = Driver {
        id: Uuid::new_v4(),
        name: payload.name,
        status: DriverStatus::Available,
        location: None,
        updated_at: Utc::now(),
    };

    state.drivers.insert(driver.id, driver.clone());
    Ok(Json(driver))
}

async fn list_drivers(State(state): State<Arc<AppState>>) -> Json<Vec<Driver>> {
    let drivers = state
        .drivers
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    Json(drivers)
}

#[derive(Deserialize)]
struct UpdateStatusRequest {
    status: DriverStatus,
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Driver>, AppError> {
    let mut driver = state
        .drivers
        .get_mut(&id)
        .ok_or_else(|| AppError::NotFound(format!("driver {id} not found")))?;

    driver.status = payload.status;
    driver.updated_at = Utc::now();

    Ok(Json(driver.clone()))
}

#[derive(Serialize)]
struct ReportResponse {
    outcome: &'static str,
}

async fn report_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SampleInput>,
) -> Result<Json<ReportResponse>, AppError> {
    let outcome = state.location.report(id, payload).await?;
    Ok(Json(ReportResponse {
        outcome: match outcome {
            ReportOutcome::Applied => "applied",
            ReportOutcome::DiscardedStale => "discarded_stale",
        },
    }))
}

#[derive(Serialize)]
struct WalletResponse {
    driver_id: Uuid,
    balance: Decimal,
    entries: Vec<WalletLedgerEntry>,
}

async fn get_wallet(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<WalletResponse>, AppError> {
    if !state.drivers.contains_key(&id) {
        return Err(AppError::NotFound(format!("driver {id} not found")));
    }

    Ok(Json(WalletResponse {
        driver_id: id,
        balance: state.settlement.balance(id).await?,
        entries: state.settlement.ledger(id).await?,
    }))
}

#[derive(Deserialize)]
struct TopUpRequest {
    amount: Decimal,
}

async fn top_up(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TopUpRequest>,
) -> Result<Json<WalletLedgerEntry>, AppError> {
    let entry = state.settlement.top_up(id, payload.amount).await?;
    Ok(Json(entry))
}
