//! API Request and Response Models

use crate::config::ModeConfig;
use crate::games::types::{Amount, ModeId, PeriodId, RoundRecord, Wager, WagerId};
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub modes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModesResponse {
    pub modes: Vec<ModeConfig>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

impl LimitQuery {
    /// Requested limit clamped to `1..=max`
    pub fn clamped(&self, default: usize, max: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsResponse {
    pub mode: ModeId,
    pub results: Vec<RoundRecord>,
}

/// POST /api/wagers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceWagerRequest {
    pub mode: ModeId,
    #[serde(default)]
    pub period: Option<PeriodId>,
    /// "Red", "Green", "Violet", "Big", "Small" or "0".."9"
    #[serde(default)]
    pub bucket: Option<String>,
    pub amount: Amount,
    /// Optional idempotency key
    #[serde(default)]
    pub wager_id: Option<WagerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WagerResponse {
    pub wager: Wager,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<Amount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WagersResponse {
    pub wagers: Vec<Wager>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashOutRequest {
    pub wager_id: WagerId,
}

/// POST /api/admin/modes/:mode/override
///
/// With `period` the named round is drawn immediately; without it the number
/// is queued for the open round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRequest {
    pub number: u8,
    #[serde(default)]
    pub period: Option<PeriodId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideResponse {
    pub mode: ModeId,
    pub period: PeriodId,
    pub number: u8,
    pub forced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_period: Option<PeriodId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsResponse {
    pub mode: ModeId,
    /// Settings that take effect when the next round opens
    pub staged: ModeConfig,
}
