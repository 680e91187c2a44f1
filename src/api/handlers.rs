//! Request Handlers
//!
//! Public game endpoints. Handlers stay thin: identity, then one engine call.

use super::{errors::ApiError, middleware::RequestId, models::*};
use crate::broadcast::ModeSnapshot;
use crate::engine::{GameEngine, WagerRequest};
use crate::games::types::{BettorId, ModeId};
use crate::identity::IdentityResolver;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    pub engine: Arc<GameEngine>,
    pub identity: Arc<dyn IdentityResolver>,
    pub admin_key: Option<String>,
}

impl AppState {
    pub(crate) fn bettor(&self, headers: &HeaderMap, request_id: &RequestId) -> Result<BettorId, ApiError> {
        self.identity.resolve(headers).ok_or_else(|| {
            ApiError::unauthorized(request_id.0.clone(), "Missing bettor identity".to_string())
        })
    }

    pub(crate) fn known_mode(&self, mode: String, request_id: &RequestId) -> Result<ModeId, ApiError> {
        let mode = ModeId::new(mode);
        if self.engine.mode_kind(&mode).is_none() {
            return Err(ApiError::not_found(
                request_id.0.clone(),
                format!("Unknown game mode: {}", mode),
            ));
        }
        Ok(mode)
    }
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Running".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        modes: state.engine.mode_ids().len(),
    })
}

/// GET /metrics
pub async fn metrics_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.engine.config().monitoring.metrics_enabled {
        return Err(ApiError::not_found(request_id.0, "Metrics are disabled".to_string()));
    }
    let body = state
        .engine
        .metrics()
        .render()
        .map_err(|e| ApiError::internal_error(request_id.0, e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

/// GET /api/modes
pub async fn modes_handler(State(state): State<Arc<AppState>>) -> Json<ModesResponse> {
    Json(ModesResponse {
        modes: state.engine.modes().await,
    })
}

/// GET /api/modes/:mode/state
pub async fn mode_state_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(mode): Path<String>,
) -> Result<Json<ModeSnapshot>, ApiError> {
    let mode = state.known_mode(mode, &request_id)?;
    state
        .engine
        .state(&mode)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(request_id.0, format!("No state for mode {}", mode)))
}

/// GET /api/modes/:mode/results?limit={n}
pub async fn results_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(mode): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<ResultsResponse>, ApiError> {
    let mode = state.known_mode(mode, &request_id)?;
    let results = state
        .engine
        .recent_results(&mode, query.clamped(10, 100))
        .await
        .map_err(|e| ApiError::from_storage(request_id.0, e))?;
    Ok(Json(ResultsResponse { mode, results }))
}

/// POST /api/wagers
pub async fn place_wager_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PlaceWagerRequest>,
) -> Result<Json<WagerResponse>, ApiError> {
    let bettor = state.bettor(&headers, &request_id)?;
    let wager = state
        .engine
        .place_wager(WagerRequest {
            bettor: bettor.clone(),
            mode: body.mode,
            period: body.period,
            bucket: body.bucket,
            amount: body.amount,
            wager_id: body.wager_id,
        })
        .await
        .map_err(|e| ApiError::from_wager(request_id.0.clone(), e))?;

    // Balance is informational; the wager already stands
    let balance = state.engine.accounts().balance(&bettor).await.ok();
    Ok(Json(WagerResponse { wager, balance }))
}

/// GET /api/wagers/mine?limit={n}
pub async fn my_wagers_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Result<Json<WagersResponse>, ApiError> {
    let bettor = state.bettor(&headers, &request_id)?;
    let wagers = state
        .engine
        .wagers_for(&bettor, query.clamped(20, 200))
        .await
        .map_err(|e| ApiError::from_storage(request_id.0, e))?;
    Ok(Json(WagersResponse { wagers }))
}

/// POST /api/crash/:mode/cashout
pub async fn cash_out_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(mode): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CashOutRequest>,
) -> Result<Json<WagerResponse>, ApiError> {
    let bettor = state.bettor(&headers, &request_id)?;
    let mode = state.known_mode(mode, &request_id)?;
    let wager = state
        .engine
        .cash_out(&bettor, &mode, &body.wager_id)
        .await
        .map_err(|e| ApiError::from_wager(request_id.0.clone(), e))?;
    let balance = state.engine.accounts().balance(&bettor).await.ok();
    Ok(Json(WagerResponse { wager, balance }))
}
