//! REST endpoints for ride intake.
//!
//! POST /api/rides              passenger opens a ride for acceptance
//! GET  /api/rides/{id}         claim state, for participants and admins
//! POST /api/rides/{id}/cancel  passenger or admin withdraws a pending ride
//! POST /api/rides/{id}/status  assigned driver or admin posts trip progress

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::api::{ApiFailure, ApiResponse, ApiResult};
use crate::auth::middleware::Claims;
use crate::auth::Role;
use crate::proto::TripStatus;
use crate::rides::arbiter::is_participant;
use crate::rides::{NewRide, RideClaim};
use crate::state::AppState;

/// POST /api/rides
pub async fn open_ride(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<NewRide>,
) -> Result<(StatusCode, Json<ApiResponse<RideClaim>>), ApiFailure> {
    if claims.role != Role::User {
        return Err(ApiFailure::Forbidden(
            "Only passengers can request rides".to_string(),
        ));
    }
    let claim = state.arbiter.open(&claims.sub, body).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::data(claim))))
}

/// GET /api/rides/{id}
pub async fn get_ride(
    State(state): State<AppState>,
    claims: Claims,
    Path(ride_id): Path<String>,
) -> ApiResult<RideClaim> {
    let claim = state.arbiter.claim(&ride_id).await?;
    // A driver who attempted the ride learns the outcome here, win or lose
    let attempted = claims.role == Role::Driver;
    if !attempted && !is_participant(&claim, &claims.sub, claims.role) {
        return Err(ApiFailure::forbidden());
    }
    Ok(Json(ApiResponse::data(claim)))
}

/// POST /api/rides/{id}/cancel
pub async fn cancel_ride(
    State(state): State<AppState>,
    claims: Claims,
    Path(ride_id): Path<String>,
) -> ApiResult<RideClaim> {
    let claim = state.arbiter.cancel(&ride_id, &claims).await?;
    Ok(Json(ApiResponse::data(claim)))
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: TripStatus,
    #[serde(default)]
    pub message: Option<String>,
}

/// POST /api/rides/{id}/status
pub async fn update_ride_status(
    State(state): State<AppState>,
    claims: Claims,
    Path(ride_id): Path<String>,
    Json(body): Json<StatusUpdateRequest>,
) -> ApiResult<RideClaim> {
    let claim = state
        .arbiter
        .update_status(&ride_id, &claims, body.status, body.message)
        .await?;
    Ok(Json(ApiResponse::data(claim)))
}
