use axum::{middleware, Router};

use crate::auth::middleware::JwtSecret;
use crate::notifications::routes as notification_routes;
use crate::presence;
use crate::rides::routes as ride_routes;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Notification list and read state (JWT required, Claims extractor validates token).
    // Fixed segments (markallread, unreadcount, read/{id}) are matched ahead of {id}.
    let notification_api = Router::new()
        .route(
            "/api/notifications",
            axum::routing::get(notification_routes::list_notifications)
                .post(notification_routes::create_notification),
        )
        .route(
            "/api/notifications/markallread",
            axum::routing::post(notification_routes::mark_all_read),
        )
        .route(
            "/api/notifications/unreadcount",
            axum::routing::get(notification_routes::unread_count),
        )
        .route(
            "/api/notifications/read/{id}",
            axum::routing::post(notification_routes::mark_read),
        )
        .route(
            "/api/notifications/{id}",
            axum::routing::delete(notification_routes::delete_notification),
        );

    // Domain-event intake from back-office collaborators (admin tokens)
    let event_routes = Router::new()
        .route(
            "/api/events/kyc",
            axum::routing::post(notification_routes::kyc_event),
        )
        .route(
            "/api/events/payment",
            axum::routing::post(notification_routes::payment_event),
        );

    let ride_api = Router::new()
        .route("/api/rides", axum::routing::post(ride_routes::open_ride))
        .route("/api/rides/{id}", axum::routing::get(ride_routes::get_ride))
        .route(
            "/api/rides/{id}/cancel",
            axum::routing::post(ride_routes::cancel_ride),
        )
        .route(
            "/api/rides/{id}/status",
            axum::routing::post(ride_routes::update_ride_status),
        );

    let presence_routes = Router::new().route(
        "/api/presence",
        axum::routing::get(presence::get_presence),
    );

    // WebSocket endpoint (auth via query param, not JWT header)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(notification_api)
        .merge(event_routes)
        .merge(ride_api)
        .merge(presence_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
