use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::auth::{Actor, Role};
use crate::engine::dispatch::{CancelOutcome, RespondAction, ResponseOutcome};
use crate::error::AppError;
use crate::models::assignment::{AssignmentRecord, AssignmentStatus};
use crate::models::order::NewAssignment;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/assignments", post(create_assignment).get(list_active))
        .route("/assignments/:order_id", get(get_assignment))
        .route("/assignments/:order_id/respond", post(respond))
        .route("/assignments/:order_id/cancel", post(cancel))
}

#[derive(Serialize)]
pub struct CreatedAssignment {
    pub id: Uuid,
    pub order_id: String,
    pub status: AssignmentStatus,
    pub record: AssignmentRecord,
}

#[derive(Deserialize)]
pub struct RespondRequest {
    pub action: RespondAction,
    #[serde(default)]
    pub reason: Option<String>,
}

async fn create_assignment(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<NewAssignment>,
) -> Result<(StatusCode, Json<CreatedAssignment>), AppError> {
    match actor.role {
        Role::Admin => {}
        Role::Customer if actor.id == payload.customer_id.trim() => {}
        _ => {
            return Err(AppError::Forbidden(
                "only admins or the ordering customer may request dispatch".to_string(),
            ));
        }
    }

    let record = state.engine.create_and_assign(payload).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedAssignment {
            id: record.id(),
            order_id: record.order_id().to_string(),
            status: record.status(),
            record,
        }),
    ))
}

async fn list_active(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<Vec<AssignmentRecord>>, AppError> {
    actor.require_admin()?;
    Ok(Json(state.engine.active().await?))
}

async fn get_assignment(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(order_id): Path<String>,
) -> Result<Json<AssignmentRecord>, AppError> {
    let record = state
        .engine
        .get(&order_id)
        .await?
        .filter(|record| actor.may_view(record))
        .ok_or_else(|| AppError::NotFound(format!("assignment for order {order_id} not found")))?;

    Ok(Json(record))
}

async fn respond(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(order_id): Path<String>,
    Json(payload): Json<RespondRequest>,
) -> Result<Response, AppError> {
    let courier_id = actor.courier_id()?;
    let outcome = state
        .engine
        .respond(&order_id, courier_id, payload.action, payload.reason)
        .await?;

    let status = match &outcome {
        ResponseOutcome::Applied(_) => StatusCode::OK,
        ResponseOutcome::StaleOffer(_) | ResponseOutcome::AlreadyTerminal(_) => StatusCode::CONFLICT,
        ResponseOutcome::NotFound => StatusCode::NOT_FOUND,
    };

    Ok((status, Json(outcome)).into_response())
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(order_id): Path<String>,
) -> Result<Response, AppError> {
    let canceller = actor.canceller()?;
    let outcome = state.engine.cancel(&order_id, canceller).await?;

    let status = match &outcome {
        CancelOutcome::Applied(_) => StatusCode::OK,
        CancelOutcome::AlreadyTerminal(_) => StatusCode::CONFLICT,
        CancelOutcome::NotFound => StatusCode::NOT_FOUND,
    };

    Ok((status, Json(outcome)).into_response())
}
