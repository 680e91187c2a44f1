//! Operator endpoints
//!
//! Mounted behind [`admin_key_middleware`](super::middleware::admin_key_middleware).

use super::{errors::ApiError, handlers::AppState, middleware::RequestId, models::*};
use crate::config::ModePatch;
use crate::engine::ReconciliationReport;
use crate::games::StakeSnapshot;
use axum::{
    extract::{Path, State},
    Extension, Json,
};
use std::sync::Arc;
use tracing::info;

/// POST /api/admin/modes/:mode/override
pub async fn override_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(mode): Path<String>,
    Json(body): Json<OverrideRequest>,
) -> Result<Json<OverrideResponse>, ApiError> {
    let mode = state.known_mode(mode, &request_id)?;

    let response = match body.period {
        Some(period) => {
            let forced = state
                .engine
                .force_draw(&mode, period, body.number)
                .await
                .map_err(|e| ApiError::from_operator(request_id.0.clone(), e))?;
            OverrideResponse {
                mode,
                period: forced.period,
                number: body.number,
                forced: true,
                next_period: Some(forced.next_period),
            }
        }
        None => {
            let period = state
                .engine
                .set_next_result(&mode, body.number)
                .await
                .map_err(|e| ApiError::from_operator(request_id.0.clone(), e))?;
            OverrideResponse {
                mode,
                period,
                number: body.number,
                forced: false,
                next_period: None,
            }
        }
    };

    info!(
        request_id = %request_id.0,
        mode = %response.mode,
        period = %response.period,
        forced = response.forced,
        "Operator override applied"
    );
    Ok(Json(response))
}

/// PUT /api/admin/modes/:mode/settings
pub async fn settings_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(mode): Path<String>,
    Json(patch): Json<ModePatch>,
) -> Result<Json<SettingsResponse>, ApiError> {
    let mode = state.known_mode(mode, &request_id)?;
    if patch.is_empty() {
        return Err(ApiError::bad_request(
            request_id.0,
            "No settings to change".to_string(),
        ));
    }
    let staged = state
        .engine
        .update_mode(&mode, &patch)
        .await
        .map_err(|e| ApiError::from_operator(request_id.0.clone(), e))?;
    Ok(Json(SettingsResponse { mode, staged }))
}

/// GET /api/admin/modes/:mode/stakes
pub async fn stakes_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(mode): Path<String>,
) -> Result<Json<StakeSnapshot>, ApiError> {
    let mode = state.known_mode(mode, &request_id)?;
    state
        .engine
        .live_stakes(&mode)
        .await
        .map(Json)
        .map_err(|e| ApiError::from_operator(request_id.0, e))
}

/// GET /api/admin/reconciliation
pub async fn reconciliation_handler(State(state): State<Arc<AppState>>) -> Json<ReconciliationReport> {
    Json(state.engine.reconciliation())
}
