use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::auth::Actor;
use crate::engine::dispatch::PartnerAssignment;
use crate::error::AppError;
use crate::geo::directory::CourierDirectory;
use crate::models::courier::{Courier, CourierStatus, GeoPoint};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/couriers", post(create_courier).get(list_couriers))
        .route("/couriers/:id/status", patch(update_courier_status))
        .route("/couriers/:id/location", patch(update_courier_location))
        .route("/couriers/:id/assignments", get(partner_assignments))
}

#[derive(Deserialize)]
pub struct CreateCourierRequest {
    pub name: String,
    pub location: GeoPoint,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: CourierStatus,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
}

fn check_location(location: &GeoPoint) -> Result<(), AppError> {
    if !location.is_valid() {
        return Err(AppError::BadRequest(
            "location is outside valid latitude/longitude ranges".to_string(),
        ));
    }
    Ok(())
}

async fn create_courier(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<CreateCourierRequest>,
) -> Result<Json<Courier>, AppError> {
    actor.require_admin()?;
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }
    check_location(&payload.location)?;

    Ok(Json(state.couriers.register(payload.name, payload.location)))
}

async fn list_couriers(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<Vec<Courier>>, AppError> {
    actor.require_admin()?;
    Ok(Json(state.couriers.list()))
}

async fn update_courier_status(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Courier>, AppError> {
    actor.require_courier_or_admin(id)?;
    let courier = state
        .couriers
        .set_status(id, payload.status)
        .ok_or_else(|| AppError::NotFound(format!("courier {} not found", id)))?;

    Ok(Json(courier))
}

async fn update_courier_location(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<Courier>, AppError> {
    actor.require_courier_or_admin(id)?;
    check_location(&payload.location)?;
    let courier = state
        .couriers
        .set_location(id, payload.location)
        .ok_or_else(|| AppError::NotFound(format!("courier {} not found", id)))?;

    Ok(Json(courier))
}

async fn partner_assignments(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<PartnerAssignment>>, AppError> {
    if !actor.may_view_courier(id) {
        return Err(AppError::Forbidden(format!(
            "not allowed to view assignments of courier {id}"
        )));
    }

    state
        .couriers
        .courier(id)
        .await
        .map_err(|err| AppError::Unavailable(err.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("courier {} not found", id)))?;

    Ok(Json(state.engine.partner_assignments(id).await?))
}
