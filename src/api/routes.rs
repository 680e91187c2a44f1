//! Route Definitions

use super::{
    admin::*,
    handlers::*,
    middleware::{admin_key_middleware, create_cors_layer, request_id_middleware},
    websocket::websocket_handler,
};
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use std::{sync::Arc, time::Duration};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/modes/:mode/override", post(override_handler))
        .route("/modes/:mode/settings", put(settings_handler))
        .route("/modes/:mode/stakes", get(stakes_handler))
        .route("/reconciliation", get(reconciliation_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_key_middleware));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/modes", get(modes_handler))
        .route("/api/modes/:mode/state", get(mode_state_handler))
        .route("/api/modes/:mode/results", get(results_handler))
        .route("/api/wagers", post(place_wager_handler))
        .route("/api/wagers/mine", get(my_wagers_handler))
        .route("/api/crash/:mode/cashout", post(cash_out_handler))
        .nest("/api/admin", admin)
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

/// Router plus the middleware stack, ready to serve
pub fn create_app(state: Arc<AppState>, allowed_origins: &[String], request_timeout: Duration) -> Router {
    create_router(state)
        // Request ID first so every layer below can log it
        .layer(middleware::from_fn(request_id_middleware))
        // CORS before timeout to handle preflight
        .layer(create_cors_layer(allowed_origins))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
}
