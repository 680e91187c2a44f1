//! Bettor identity resolution
//!
//! Authentication happens upstream; the engine only needs a stable id per
//! request or connection.

use crate::games::types::BettorId;
use axum::http::HeaderMap;

/// Header carrying the authenticated bettor id
pub const BETTOR_ID_HEADER: &str = "x-bettor-id";

const MAX_BETTOR_ID_LEN: usize = 128;

pub trait IdentityResolver: Send + Sync {
    /// `None` when the request carries no usable identity
    fn resolve(&self, headers: &HeaderMap) -> Option<BettorId>;
}

/// Trusts the `x-bettor-id` header set by the gateway
#[derive(Debug, Clone, Default)]
pub struct HeaderIdentity;

impl IdentityResolver for HeaderIdentity {
    fn resolve(&self, headers: &HeaderMap) -> Option<BettorId> {
        let raw = headers.get(BETTOR_ID_HEADER)?.to_str().ok()?.trim();
        if raw.is_empty() || raw.len() > MAX_BETTOR_ID_LEN {
            return None;
        }
        Some(BettorId::new(raw))
    }
}
