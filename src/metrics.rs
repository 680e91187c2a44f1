//! Prometheus metrics for the round pipeline
//!
//! Each engine owns its registry, so tests can build any number of engines.
//! `roundhouse_mode_last_tick_unix_seconds` lets an external alert catch a stalled
//! mode timer independently of the engine itself.

use crate::errors::MonitoringError;
use crate::games::types::ModeId;
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    wagers_accepted: IntCounterVec,
    wagers_rejected: IntCounterVec,
    rounds_settled: IntCounterVec,
    rounds_failed: IntCounterVec,
    payouts: IntCounterVec,
    credit_retries: IntCounterVec,
    last_tick: GaugeVec,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, MonitoringError> {
        let registry = Registry::new();

        let wagers_accepted = IntCounterVec::new(
            Opts::new("roundhouse_wagers_accepted_total", "Wagers accepted"),
            &["mode"],
        )?;
        let wagers_rejected = IntCounterVec::new(
            Opts::new("roundhouse_wagers_rejected_total", "Wagers rejected by reason"),
            &["mode", "reason"],
        )?;
        let rounds_settled = IntCounterVec::new(
            Opts::new("roundhouse_rounds_settled_total", "Rounds fully settled"),
            &["mode"],
        )?;
        let rounds_failed = IntCounterVec::new(
            Opts::new(
                "roundhouse_rounds_failed_total",
                "Rounds flagged for manual reconciliation",
            ),
            &["mode"],
        )?;
        let payouts = IntCounterVec::new(
            Opts::new("roundhouse_payout_units_total", "Minor units credited to winners"),
            &["mode"],
        )?;
        let credit_retries = IntCounterVec::new(
            Opts::new("roundhouse_credit_retries_total", "Credit attempts by outcome"),
            &["outcome"],
        )?;
        let last_tick = GaugeVec::new(
            Opts::new(
                "roundhouse_mode_last_tick_unix_seconds",
                "Wall clock of the last scheduler tick per mode",
            ),
            &["mode"],
        )?;

        registry.register(Box::new(wagers_accepted.clone()))?;
        registry.register(Box::new(wagers_rejected.clone()))?;
        registry.register(Box::new(rounds_settled.clone()))?;
        registry.register(Box::new(rounds_failed.clone()))?;
        registry.register(Box::new(payouts.clone()))?;
        registry.register(Box::new(credit_retries.clone()))?;
        registry.register(Box::new(last_tick.clone()))?;

        Ok(Self {
            registry,
            wagers_accepted,
            wagers_rejected,
            rounds_settled,
            rounds_failed,
            payouts,
            credit_retries,
            last_tick,
        })
    }

    pub fn wager_accepted(&self, mode: &ModeId) {
        self.wagers_accepted.with_label_values(&[mode.as_str()]).inc();
    }

    pub fn wager_rejected(&self, mode: &ModeId, reason: &str) {
        self.wagers_rejected
            .with_label_values(&[mode.as_str(), reason])
            .inc();
    }

    pub fn round_settled(&self, mode: &ModeId) {
        self.rounds_settled.with_label_values(&[mode.as_str()]).inc();
    }

    pub fn round_failed(&self, mode: &ModeId) {
        self.rounds_failed.with_label_values(&[mode.as_str()]).inc();
    }

    pub fn payout(&self, mode: &ModeId, amount: u64) {
        self.payouts.with_label_values(&[mode.as_str()]).inc_by(amount);
    }

    pub fn credit_retry(&self, outcome: &str) {
        self.credit_retries.with_label_values(&[outcome]).inc();
    }

    pub fn ticked(&self, mode: &ModeId, unix_seconds: i64) {
        self.last_tick
            .with_label_values(&[mode.as_str()])
            .set(unix_seconds as f64);
    }

    pub fn rounds_failed_count(&self, mode: &ModeId) -> u64 {
        self.rounds_failed.with_label_values(&[mode.as_str()]).get()
    }

    /// Prometheus text exposition
    pub fn render(&self) -> Result<String, MonitoringError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(MonitoringError::from)?;
        String::from_utf8(buffer).map_err(|e| MonitoringError::Encoding(e.to_string()))
    }
}
