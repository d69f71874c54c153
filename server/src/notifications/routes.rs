//! REST endpoints for the notification list and read state.
//!
//! GET    /api/notifications              viewer's notifications, newest first
//! POST   /api/notifications              create an announcement (admin)
//! POST   /api/notifications/read/{id}    mark one read
//! POST   /api/notifications/markallread  mark all read
//! DELETE /api/notifications/{id}         dismiss for the caller
//! GET    /api/notifications/unreadcount  unread count
//! POST   /api/events/kyc                 KYC decision intake (admin)
//! POST   /api/events/payment             payment outcome intake (admin)

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;

use crate::api::{ApiFailure, ApiResponse, ApiResult};
use crate::auth::middleware::Claims;
use crate::notifications::events::{Announcement, DomainEvent};
use crate::notifications::model::{KycVerdict, Notification, PaymentOutcome};
use crate::notifications::store::{self, NotificationError};
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
}

/// Run a store call on the blocking pool with the connection locked.
async fn with_conn<T, F>(state: &AppState, f: F) -> Result<T, ApiFailure>
where
    T: Send + 'static,
    F: FnOnce(&rusqlite::Connection) -> Result<T, NotificationError> + Send + 'static,
{
    let db = state.db.clone();
    let result = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| NotificationError::LockPoisoned)?;
        f(&conn)
    })
    .await?;
    Ok(result?)
}

/// GET /api/notifications
pub async fn list_notifications(
    State(state): State<AppState>,
    claims: Claims,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Notification>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let Claims { sub, role, .. } = claims;
    let list = with_conn(&state, move |conn| {
        store::list_for_viewer(conn, &sub, role, limit)
    })
    .await?;
    Ok(Json(ApiResponse::data(list)))
}

/// POST /api/notifications
/// Admin-only. The server assigns the id; `idempotencyKey` makes retries safe.
pub async fn create_notification(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<Announcement>,
) -> Result<(StatusCode, Json<ApiResponse<Notification>>), ApiFailure> {
    if !claims.is_admin() {
        return Err(ApiFailure::forbidden());
    }
    if body.title.trim().is_empty() {
        return Err(ApiFailure::BadRequest("Title is required".to_string()));
    }
    if body.target_role.is_none() && body.target_user_ids.is_empty() {
        return Err(ApiFailure::BadRequest(
            "Either targetRole or targetUserIds is required".to_string(),
        ));
    }

    let notification = state
        .dispatcher
        .dispatch(DomainEvent::Announcement(body))
        .await?;
    tracing::info!(
        admin = %claims.sub,
        notification_id = %notification.id,
        "Announcement created"
    );
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::data(notification.for_viewer(&claims.sub))),
    ))
}

/// POST /api/notifications/read/{id}
pub async fn mark_read(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<String>,
) -> ApiResult<()> {
    let Claims { sub, role, .. } = claims;
    with_conn(&state, move |conn| {
        store::mark_read(conn, &id, &sub, role, Utc::now())
    })
    .await?;
    Ok(Json(ApiResponse::message("Notification marked as read")))
}

/// POST /api/notifications/markallread
pub async fn mark_all_read(State(state): State<AppState>, claims: Claims) -> ApiResult<()> {
    let Claims { sub, role, .. } = claims;
    let marked = with_conn(&state, move |conn| {
        store::mark_all_read(conn, &sub, role, Utc::now())
    })
    .await?;
    Ok(Json(ApiResponse::count(marked as u64)))
}

/// DELETE /api/notifications/{id}
/// Removes the notification from the caller's list only.
pub async fn delete_notification(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<String>,
) -> ApiResult<()> {
    let Claims { sub, role, .. } = claims;
    with_conn(&state, move |conn| {
        store::dismiss(conn, &id, &sub, role, Utc::now())
    })
    .await?;
    Ok(Json(ApiResponse::message("Notification deleted")))
}

/// GET /api/notifications/unreadcount
pub async fn unread_count(State(state): State<AppState>, claims: Claims) -> ApiResult<()> {
    let Claims { sub, role, .. } = claims;
    let count = with_conn(&state, move |conn| store::unread_count(conn, &sub, role)).await?;
    Ok(Json(ApiResponse::count(count)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KycEventRequest {
    pub user_id: String,
    pub document_id: String,
    pub verdict: KycVerdict,
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/events/kyc
pub async fn kyc_event(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<KycEventRequest>,
) -> ApiResult<Notification> {
    if !claims.is_admin() {
        return Err(ApiFailure::forbidden());
    }
    let notification = state
        .dispatcher
        .dispatch(DomainEvent::KycReviewed {
            user_id: body.user_id,
            document_id: body.document_id,
            verdict: body.verdict,
            reason: body.reason,
        })
        .await?;
    Ok(Json(ApiResponse::data(notification)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEventRequest {
    pub payment_id: String,
    pub user_id: String,
    #[serde(default)]
    pub ride_id: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub outcome: PaymentOutcome,
}

/// POST /api/events/payment
pub async fn payment_event(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<PaymentEventRequest>,
) -> ApiResult<Notification> {
    if !claims.is_admin() {
        return Err(ApiFailure::forbidden());
    }
    if !body.amount.is_finite() || body.amount < 0.0 {
        return Err(ApiFailure::BadRequest("Amount must be non-negative".to_string()));
    }
    let notification = state
        .dispatcher
        .dispatch(DomainEvent::PaymentProcessed {
            payment_id: body.payment_id,
            user_id: body.user_id,
            ride_id: body.ride_id,
            amount: body.amount,
            currency: body.currency,
            outcome: body.outcome,
        })
        .await?;
    Ok(Json(ApiResponse::data(notification)))
}
