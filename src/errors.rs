//! Error types for the round engine
//!
//! One enum per concern, rolled up into [`RoundhouseError`]. Wager rejections carry
//! a stable machine-readable code so the HTTP edge can report an explicit reason.

use crate::games::types::{Amount, BettorId, HouseStrategy, ModeId, PeriodId, WagerId};
use thiserror::Error;

/// Root error type for all engine operations
#[derive(Debug, Error)]
pub enum RoundhouseError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Wager rejected: {0}")]
    Wager(#[from] WagerError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Account error: {0}")]
    Account(#[from] AccountError),

    #[error("Operator error: {0}")]
    Operator(#[from] OperatorError),

    #[error("Monitoring error: {0}")]
    Monitoring(#[from] MonitoringError),
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

/// Synchronous wager rejections. None of these mutate state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WagerError {
    #[error("Unknown game mode: {0}")]
    UnknownMode(ModeId),

    #[error("Invalid bucket: {0}")]
    InvalidBucket(String),

    #[error("A bucket is required for discrete modes")]
    MissingBucket,

    #[error("Stake {amount} is below the minimum of {min}")]
    BelowMinimum { amount: Amount, min: Amount },

    #[error("Stake {amount} is above the maximum of {max}")]
    AboveMaximum { amount: Amount, max: Amount },

    #[error("Round {period} is locked for betting")]
    RoundLocked { period: PeriodId },

    #[error("Period {requested} is not open (current period is {current})")]
    PeriodMismatch { requested: PeriodId, current: PeriodId },

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Bucket stake overflow")]
    StakeOverflow,

    #[error("Wager {0} not found")]
    NotFound(WagerId),

    #[error("Wager id {0} is already taken")]
    DuplicateId(WagerId),

    #[error("Wager {0} is still being placed")]
    InProgress(WagerId),

    #[error("Wager {0} has already cashed out")]
    AlreadyCashedOut(WagerId),

    #[error("Round is not running")]
    NotRunning,

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl WagerError {
    /// Stable reason code reported to clients
    pub fn code(&self) -> &'static str {
        match self {
            WagerError::UnknownMode(_) => "UNKNOWN_MODE",
            WagerError::InvalidBucket(_) => "INVALID_BUCKET",
            WagerError::MissingBucket => "MISSING_BUCKET",
            WagerError::BelowMinimum { .. } => "BELOW_MINIMUM",
            WagerError::AboveMaximum { .. } => "ABOVE_MAXIMUM",
            WagerError::RoundLocked { .. } => "ROUND_LOCKED",
            WagerError::PeriodMismatch { .. } => "PERIOD_MISMATCH",
            WagerError::InsufficientFunds => "INSUFFICIENT_FUNDS",
            WagerError::StakeOverflow => "STAKE_OVERFLOW",
            WagerError::NotFound(_) => "WAGER_NOT_FOUND",
            WagerError::DuplicateId(_) => "DUPLICATE_WAGER_ID",
            WagerError::InProgress(_) => "WAGER_IN_PROGRESS",
            WagerError::AlreadyCashedOut(_) => "ALREADY_CASHED_OUT",
            WagerError::NotRunning => "ROUND_NOT_RUNNING",
            WagerError::Unavailable(_) => "UNAVAILABLE",
        }
    }
}

/// Settlement pipeline errors
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Round {period} of mode {mode} has no drawn result")]
    MissingResult { mode: ModeId, period: PeriodId },

    #[error("{failed} wager(s) of period {period} could not be recorded")]
    Incomplete { period: PeriodId, failed: u32 },
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database open failed: {0}")]
    DatabaseOpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::WriteFailed(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::CorruptedData(e.to_string())
    }
}

/// Balance collaborator errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("Insufficient funds for {bettor}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        bettor: BettorId,
        balance: Amount,
        requested: Amount,
    },

    #[error("Account service unavailable: {0}")]
    Unavailable(String),
}

/// Administrative command errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperatorError {
    #[error("Unknown game mode: {0}")]
    UnknownMode(ModeId),

    #[error("Number {0} is outside 0-9")]
    InvalidNumber(u8),

    #[error("Mode {mode} uses the {strategy} strategy")]
    StrategyMismatch { mode: ModeId, strategy: HouseStrategy },

    #[error("Round {period} was already drawn")]
    Superseded { period: PeriodId },

    #[error("Mode {0} does not support this command")]
    UnsupportedMode(ModeId),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

/// Metrics registry errors
#[derive(Debug, Error)]
pub enum MonitoringError {
    #[error("Metrics registration failed: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("Metrics encoding failed: {0}")]
    Encoding(String),
}

/// Convenience type alias for Results
pub type RoundhouseResult<T> = Result<T, RoundhouseError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let config_error = ConfigurationError::ValidationFailed("test".to_string());
        let error = RoundhouseError::Configuration(config_error);

        assert!(error.to_string().contains("Configuration error"));
        assert!(error.to_string().contains("test"));
    }

    #[test]
    fn test_wager_error_codes() {
        let locked = WagerError::RoundLocked {
            period: PeriodId::new(20240101120000),
        };
        assert_eq!(locked.code(), "ROUND_LOCKED");
        assert!(locked.to_string().contains("20240101120000"));

        let low = WagerError::BelowMinimum { amount: 5, min: 10 };
        assert_eq!(low.code(), "BELOW_MINIMUM");
        assert!(low.to_string().contains("minimum of 10"));
    }

    #[test]
    fn test_error_conversion() {
        let error: RoundhouseError = WagerError::InsufficientFunds.into();
        assert!(matches!(error, RoundhouseError::Wager(WagerError::InsufficientFunds)));
    }

    #[test]
    fn test_settlement_error_source() {
        let error = SettlementError::Storage(StorageError::ReadFailed("disk".to_string()));
        assert!(error.to_string().contains("disk"));

        let wrapped = RoundhouseError::Settlement(error);
        assert!(wrapped.source().is_some());
    }
}
