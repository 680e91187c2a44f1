//! Game engine
//!
//! Owns one state table per mode and wires the tables to persistence, the
//! account collaborator, settlement and the broadcast hub. Each table sits
//! behind its own async mutex, so modes never contend with each other. Draws
//! release the lock before settlement is spawned; the next round is already
//! open by then.

use crate::accounts::{AccountService, InMemoryAccounts};
use crate::broadcast::{BroadcastHub, GameEvent, ModeSnapshot};
use crate::config::{EngineConfig, ModeConfig, ModePatch, StorageBackend};
use crate::errors::{
    AccountError, OperatorError, RoundhouseResult, SettlementError, StorageError, WagerError,
};
use crate::games::crash::{CrashStep, CrashTable};
use crate::games::round::{ClosedRound, ModeTable, RoundOpening, TickOutcome};
use crate::games::settlement::{
    CreditOutcome, ExhaustedCredit, PayoutTable, RetrySummary, SettlementEngine,
};
use crate::games::types::{
    Amount, BettorId, Bucket, DrawResult, ModeId, ModeKind, Multiplier, PeriodId, RecentResult,
    RoundRecord, RoundStatus, SelectionSource, Wager, WagerId, WagerKind, WagerStatus,
};
use crate::games::StakeSnapshot;
use crate::metrics::EngineMetrics;
use crate::store::{MemoryStore, RecordStore, RocksStore};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

enum GameMode {
    Discrete(Mutex<ModeTable>),
    Crash(Mutex<CrashTable>),
}

/// A wager as submitted by a bettor
#[derive(Debug, Clone)]
pub struct WagerRequest {
    pub bettor: BettorId,
    pub mode: ModeId,
    /// Round the bettor is looking at; `None` means whatever is open
    pub period: Option<PeriodId>,
    /// Bucket key such as `"Red"` or `"7"`; ignored for crash modes
    pub bucket: Option<String>,
    pub amount: Amount,
    /// Client-supplied idempotency key
    pub wager_id: Option<WagerId>,
}

/// A round whose pipeline failed and needs an operator
#[derive(Debug, Clone, Serialize)]
pub struct FailedRound {
    pub mode: ModeId,
    pub period: PeriodId,
    pub reason: String,
    pub flagged_at: DateTime<Utc>,
}

/// A stake that could not be handed back after a rejected placement
#[derive(Debug, Clone, Serialize)]
pub struct FailedRefund {
    pub bettor: BettorId,
    pub wager_id: WagerId,
    pub amount: Amount,
    pub error: String,
    pub flagged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub failed_rounds: Vec<FailedRound>,
    pub exhausted_credits: Vec<ExhaustedCredit>,
    pub failed_refunds: Vec<FailedRefund>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub resettled: u32,
    pub voided: u32,
    pub refunded: u32,
}

/// What one scheduler tick did
#[derive(Debug)]
pub enum TickReport {
    Advanced,
    Drawn {
        period: PeriodId,
        result: DrawResult,
        settlement: JoinHandle<RoundStatus>,
    },
    Crashed {
        period: PeriodId,
        crash_point: Multiplier,
        settlement: JoinHandle<RoundStatus>,
    },
}

impl TickReport {
    pub fn settlement(self) -> Option<JoinHandle<RoundStatus>> {
        match self {
            TickReport::Advanced => None,
            TickReport::Drawn { settlement, .. } | TickReport::Crashed { settlement, .. } => {
                Some(settlement)
            }
        }
    }
}

/// Result of an operator-forced draw
#[derive(Debug)]
pub struct ForcedDraw {
    pub period: PeriodId,
    pub result: DrawResult,
    pub next_period: PeriodId,
    pub settlement: JoinHandle<RoundStatus>,
}

pub struct GameEngine {
    modes: HashMap<ModeId, GameMode>,
    order: Vec<ModeId>,
    store: Arc<dyn RecordStore>,
    accounts: Arc<dyn AccountService>,
    hub: BroadcastHub,
    settlement: Arc<SettlementEngine>,
    metrics: EngineMetrics,
    config: EngineConfig,
    failed_rounds: DashMap<(ModeId, PeriodId), FailedRound>,
    failed_refunds: DashMap<WagerId, FailedRefund>,
    /// Wager ids between reservation and persistence, with the bettor placing them
    in_flight: DashMap<WagerId, BettorId>,
}

/// Releases an in-flight wager id when placement finishes, however it finishes
struct Reservation<'a> {
    in_flight: &'a DashMap<WagerId, BettorId>,
    wager_id: WagerId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.wager_id);
    }
}

impl GameEngine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn settlement(&self) -> &SettlementEngine {
        &self.settlement
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        Arc::clone(&self.store)
    }

    pub fn accounts(&self) -> Arc<dyn AccountService> {
        Arc::clone(&self.accounts)
    }

    /// Configured mode ids in configuration order
    pub fn mode_ids(&self) -> &[ModeId] {
        &self.order
    }

    pub fn mode_kind(&self, mode: &ModeId) -> Option<ModeKind> {
        self.modes.get(mode).map(|m| match m {
            GameMode::Discrete(_) => ModeKind::Discrete,
            GameMode::Crash(_) => ModeKind::Crash,
        })
    }

    /// Current settings of every mode
    pub async fn modes(&self) -> Vec<ModeConfig> {
        let mut configs = Vec::with_capacity(self.order.len());
        for id in &self.order {
            if let Some(config) = self.mode_config(id).await {
                configs.push(config);
            }
        }
        configs
    }

    pub async fn mode_config(&self, mode: &ModeId) -> Option<ModeConfig> {
        match self.modes.get(mode)? {
            GameMode::Discrete(table) => Some(table.lock().await.config().clone()),
            GameMode::Crash(table) => Some(table.lock().await.config().clone()),
        }
    }

    // ------------------------------------------------------------------
    // Wagers
    // ------------------------------------------------------------------

    /// Validate, debit and record a wager
    pub async fn place_wager(&self, request: WagerRequest) -> Result<Wager, WagerError> {
        let mode = request.mode.clone();
        match self.try_place(request).await {
            Ok(wager) => {
                self.metrics.wager_accepted(&mode);
                info!(
                    wager_id = %wager.id,
                    mode = %wager.mode,
                    period = %wager.period,
                    bettor = %wager.bettor,
                    amount = wager.amount,
                    "Wager accepted"
                );
                Ok(wager)
            }
            Err(e) => {
                self.metrics.wager_rejected(&mode, e.code());
                debug!(mode = %mode, reason = e.code(), error = %e, "Wager rejected");
                Err(e)
            }
        }
    }

    async fn try_place(&self, request: WagerRequest) -> Result<Wager, WagerError> {
        let wager_id = request.wager_id.clone().unwrap_or_else(WagerId::generate);

        // Held until the wager is persisted or rejected; a replay of the same id
        // checks the store only after it owns the reservation
        let _reservation = self.reserve(&wager_id, &request.bettor)?;

        if request.wager_id.is_some() {
            let existing = self
                .store
                .find_wager(&wager_id)
                .await
                .map_err(|e| WagerError::Unavailable(e.to_string()))?;
            if let Some(existing) = existing {
                if existing.bettor != request.bettor {
                    return Err(WagerError::DuplicateId(wager_id));
                }
                debug!(wager_id = %wager_id, "Duplicate wager id, returning existing wager");
                return Ok(existing);
            }
        }

        let game = self
            .modes
            .get(&request.mode)
            .ok_or_else(|| WagerError::UnknownMode(request.mode.clone()))?;

        match game {
            GameMode::Discrete(table) => {
                let bucket = Bucket::from_str(request.bucket.as_deref().ok_or(WagerError::MissingBucket)?)?;
                let period = {
                    let table = table.lock().await;
                    table.validate_amount(request.amount)?;
                    let period = request.period.unwrap_or(table.round().period);
                    table.check_open(period)?;
                    period
                };

                self.debit(&request.bettor, request.amount, &wager_id).await?;

                let mut table = table.lock().await;
                if let Err(e) = table.record(period, bucket, request.amount) {
                    drop(table);
                    self.refund(&request.bettor, request.amount, &wager_id).await;
                    return Err(match e {
                        // Drew while the debit was in flight
                        WagerError::PeriodMismatch { requested, .. } => {
                            WagerError::RoundLocked { period: requested }
                        }
                        other => other,
                    });
                }

                let wager = new_wager(wager_id, &request, period, WagerKind::Discrete { bucket });
                if let Err(e) = self.store.put_wager(&wager).await {
                    table.revert(period, bucket, request.amount);
                    drop(table);
                    error!(wager_id = %wager.id, error = %e, "Failed to persist wager");
                    self.refund(&request.bettor, request.amount, &wager.id).await;
                    return Err(WagerError::Unavailable(e.to_string()));
                }
                Ok(wager)
            }
            GameMode::Crash(table) => {
                let period = {
                    let table = table.lock().await;
                    table.validate_amount(request.amount)?;
                    table.check_open(request.period)?
                };

                self.debit(&request.bettor, request.amount, &wager_id).await?;

                let mut table = table.lock().await;
                if let Err(e) = table.join(Some(period), &wager_id, &request.bettor, request.amount) {
                    drop(table);
                    self.refund(&request.bettor, request.amount, &wager_id).await;
                    return Err(match e {
                        WagerError::PeriodMismatch { requested, .. } => {
                            WagerError::RoundLocked { period: requested }
                        }
                        other => other,
                    });
                }

                let wager = new_wager(
                    wager_id,
                    &request,
                    period,
                    WagerKind::Crash { cashed_out_at: None },
                );
                if let Err(e) = self.store.put_wager(&wager).await {
                    table.remove(&wager.id);
                    drop(table);
                    error!(wager_id = %wager.id, error = %e, "Failed to persist wager");
                    self.refund(&request.bettor, request.amount, &wager.id).await;
                    return Err(WagerError::Unavailable(e.to_string()));
                }
                Ok(wager)
            }
        }
    }

    fn reserve(&self, wager_id: &WagerId, bettor: &BettorId) -> Result<Reservation<'_>, WagerError> {
        match self.in_flight.entry(wager_id.clone()) {
            Entry::Occupied(holder) if holder.get() == bettor => Err(WagerError::InProgress(wager_id.clone())),
            Entry::Occupied(_) => Err(WagerError::DuplicateId(wager_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(bettor.clone());
                Ok(Reservation {
                    in_flight: &self.in_flight,
                    wager_id: wager_id.clone(),
                })
            }
        }
    }

    async fn debit(&self, bettor: &BettorId, amount: Amount, wager_id: &WagerId) -> Result<(), WagerError> {
        let reference = format!("debit:{}", wager_id);
        self.accounts
            .debit(bettor, amount, &reference)
            .await
            .map_err(|e| match e {
                AccountError::InsufficientFunds { .. } => WagerError::InsufficientFunds,
                AccountError::Unavailable(msg) => WagerError::Unavailable(msg),
            })
    }

    async fn refund(&self, bettor: &BettorId, amount: Amount, wager_id: &WagerId) {
        let reference = format!("refund:{}", wager_id);
        if let Err(e) = self.accounts.credit(bettor, amount, &reference).await {
            error!(wager_id = %wager_id, bettor = %bettor, amount, error = %e, "Refund failed");
            self.failed_refunds.insert(
                wager_id.clone(),
                FailedRefund {
                    bettor: bettor.clone(),
                    wager_id: wager_id.clone(),
                    amount,
                    error: e.to_string(),
                    flagged_at: Utc::now(),
                },
            );
        }
    }

    /// Lock in the running multiplier for a crash wager and pay it out
    pub async fn cash_out(&self, bettor: &BettorId, mode: &ModeId, wager_id: &WagerId) -> Result<Wager, WagerError> {
        let Some(GameMode::Crash(table)) = self.modes.get(mode) else {
            if self.modes.contains_key(mode) {
                return Err(WagerError::NotRunning);
            }
            return Err(WagerError::UnknownMode(mode.clone()));
        };

        let mut wager = {
            let mut table = table.lock().await;
            let (multiplier, payout) = table.cash_out(wager_id, bettor)?;
            let period = table.period();

            let stored = match self.store.load_wager(mode, period, wager_id).await {
                Ok(Some(w)) => w,
                Ok(None) => {
                    table.undo_cash_out(wager_id);
                    return Err(WagerError::NotFound(wager_id.clone()));
                }
                Err(e) => {
                    table.undo_cash_out(wager_id);
                    return Err(WagerError::Unavailable(e.to_string()));
                }
            };

            let mut wager = stored;
            wager.kind = WagerKind::Crash {
                cashed_out_at: Some(multiplier),
            };
            wager.payout = payout;
            wager.status = WagerStatus::AwaitingCredit;
            if let Err(e) = self.store.put_wager(&wager).await {
                table.undo_cash_out(wager_id);
                error!(wager_id = %wager_id, error = %e, "Failed to persist cash-out");
                return Err(WagerError::Unavailable(e.to_string()));
            }
            wager
        };

        let multiplier = wager.cashed_out_at().unwrap_or(Multiplier::ONE);
        info!(
            wager_id = %wager.id,
            bettor = %bettor,
            multiplier = %multiplier,
            payout = wager.payout,
            "Cashed out"
        );
        self.hub.publish(GameEvent::CashedOut {
            mode: mode.clone(),
            period: wager.period,
            wager_id: wager.id.clone(),
            bettor: bettor.clone(),
            multiplier,
            payout: wager.payout,
        });

        if let CreditOutcome::Credited(_) = self.settlement.credit_winner(wager.clone(), 0, Instant::now()).await {
            wager.status = WagerStatus::Won;
        }
        Ok(wager)
    }

    pub async fn wagers_for(&self, bettor: &BettorId, limit: usize) -> Result<Vec<Wager>, StorageError> {
        self.store.wagers_for_bettor(bettor, limit).await
    }

    // ------------------------------------------------------------------
    // Clock
    // ------------------------------------------------------------------

    /// Advance `mode` by one tick of its own cadence
    pub async fn tick(self: &Arc<Self>, mode: &ModeId) -> Option<TickReport> {
        let report = match self.modes.get(mode)? {
            GameMode::Discrete(table) => self.tick_discrete(mode, table).await,
            GameMode::Crash(table) => self.tick_crash(mode, table).await,
        };
        self.metrics.ticked(mode, Utc::now().timestamp());
        Some(report)
    }

    async fn tick_discrete(self: &Arc<Self>, mode: &ModeId, table: &Mutex<ModeTable>) -> TickReport {
        let now = Utc::now();
        let (outcome, live) = {
            let mut table = table.lock().await;
            let outcome = table.tick(now);
            (outcome, table.live_state())
        };
        self.hub.set_live(mode, live);

        match outcome {
            TickOutcome::Countdown {
                period,
                remaining_secs,
                locked,
            } => {
                self.hub.publish(GameEvent::Countdown {
                    mode: mode.clone(),
                    period,
                    remaining_secs,
                    locked,
                });
                TickReport::Advanced
            }
            TickOutcome::Locked {
                period,
                opened_at,
                remaining_secs,
                snapshot,
            } => {
                debug!(mode = %mode, period = %period, remaining_secs, "Betting locked");
                let record = RoundRecord {
                    mode: mode.clone(),
                    period,
                    status: RoundStatus::Closing,
                    result: None,
                    crash_point: None,
                    source: None,
                    opened_at,
                    closed_at: None,
                    total_staked: snapshot.total_amount(),
                    wager_count: snapshot.total_count(),
                };
                if let Err(e) = self.store.put_round(&record).await {
                    warn!(mode = %mode, period = %period, error = %e, "Failed to persist closing round");
                }
                self.hub.publish(GameEvent::BettingLocked {
                    mode: mode.clone(),
                    period,
                    remaining_secs,
                });
                TickReport::Advanced
            }
            TickOutcome::Drawn(closed) => {
                let period = closed.period;
                let result = closed.selection.result;
                let settlement = self.finish_draw(mode, closed).await;
                TickReport::Drawn {
                    period,
                    result,
                    settlement,
                }
            }
        }
    }

    async fn finish_draw(self: &Arc<Self>, mode: &ModeId, closed: ClosedRound) -> JoinHandle<RoundStatus> {
        let record = RoundRecord {
            mode: mode.clone(),
            period: closed.period,
            status: RoundStatus::Drawn,
            result: Some(closed.selection.result),
            crash_point: None,
            source: Some(closed.selection.source),
            opened_at: closed.opened_at,
            closed_at: Some(closed.closed_at),
            total_staked: closed.snapshot.total_amount(),
            wager_count: closed.snapshot.total_count(),
        };
        info!(
            mode = %mode,
            period = %closed.period,
            result = %closed.selection.result,
            source = ?closed.selection.source,
            total_staked = record.total_staked,
            wagers = record.wager_count,
            "Round drawn"
        );

        if let Err(e) = self.store.put_round(&record).await {
            error!(mode = %mode, period = %record.period, error = %e, "Failed to persist drawn round");
        }
        self.hub.publish(GameEvent::ResultDrawn {
            mode: mode.clone(),
            period: closed.period,
            result: closed.selection.result,
        });
        self.hub.record_result(mode, RecentResult::from(&record));

        self.announce_opening(mode, &closed.next).await;
        self.spawn_settlement(record)
    }

    async fn announce_opening(&self, mode: &ModeId, opening: &RoundOpening) {
        let record = RoundRecord {
            mode: mode.clone(),
            period: opening.period,
            status: RoundStatus::Open,
            result: None,
            crash_point: None,
            source: None,
            opened_at: opening.opened_at,
            closed_at: None,
            total_staked: 0,
            wager_count: 0,
        };
        if let Err(e) = self.store.put_round(&record).await {
            warn!(mode = %mode, period = %opening.period, error = %e, "Failed to persist opened round");
        }
        self.hub.publish(GameEvent::RoundOpened {
            mode: mode.clone(),
            period: opening.period,
            duration_secs: opening.duration_secs,
            closes_at: opening.closes_at,
        });
    }

    async fn tick_crash(self: &Arc<Self>, mode: &ModeId, table: &Mutex<CrashTable>) -> TickReport {
        let now = Utc::now();
        let (step, live) = {
            let mut table = table.lock().await;
            let step = table.tick(now);
            (step, table.live_state())
        };
        self.hub.set_live(mode, live);

        match step {
            CrashStep::Waiting { period, ticks_left } => {
                self.hub.publish(GameEvent::CrashWaiting {
                    mode: mode.clone(),
                    period,
                    starts_in_ms: ticks_left * self.config.crash.tick_ms,
                });
                TickReport::Advanced
            }
            CrashStep::Started { period } => {
                info!(mode = %mode, period = %period, "Crash round started");
                self.hub.publish(GameEvent::CrashStarted {
                    mode: mode.clone(),
                    period,
                });
                TickReport::Advanced
            }
            CrashStep::Tick { period, multiplier } => {
                self.hub.publish(GameEvent::MultiplierTick {
                    mode: mode.clone(),
                    period,
                    multiplier,
                });
                TickReport::Advanced
            }
            CrashStep::Crashed {
                period,
                opened_at,
                crash_point,
                total_staked,
                wager_count,
            } => {
                let record = RoundRecord {
                    mode: mode.clone(),
                    period,
                    status: RoundStatus::Drawn,
                    result: None,
                    crash_point: Some(crash_point),
                    source: Some(SelectionSource::Crash),
                    opened_at,
                    closed_at: Some(now),
                    total_staked,
                    wager_count,
                };
                info!(mode = %mode, period = %period, crash_point = %crash_point, wagers = wager_count, "Crashed");
                if let Err(e) = self.store.put_round(&record).await {
                    error!(mode = %mode, period = %period, error = %e, "Failed to persist crashed round");
                }
                self.hub.publish(GameEvent::Crashed {
                    mode: mode.clone(),
                    period,
                    crash_point,
                });
                self.hub.record_result(mode, RecentResult::from(&record));
                TickReport::Crashed {
                    period,
                    crash_point,
                    settlement: self.spawn_settlement(record),
                }
            }
            CrashStep::Cooldown { .. } => TickReport::Advanced,
            CrashStep::Opened {
                period,
                opened_at,
                starts_in_ms,
            } => {
                self.persist_crash_opening(mode, period, opened_at).await;
                self.hub.publish(GameEvent::CrashWaiting {
                    mode: mode.clone(),
                    period,
                    starts_in_ms,
                });
                TickReport::Advanced
            }
        }
    }

    async fn persist_crash_opening(&self, mode: &ModeId, period: PeriodId, opened_at: DateTime<Utc>) {
        let record = RoundRecord {
            mode: mode.clone(),
            period,
            status: RoundStatus::Open,
            result: None,
            crash_point: None,
            source: None,
            opened_at,
            closed_at: None,
            total_staked: 0,
            wager_count: 0,
        };
        if let Err(e) = self.store.put_round(&record).await {
            warn!(mode = %mode, period = %period, error = %e, "Failed to persist opened round");
        }
    }

    fn spawn_settlement(self: &Arc<Self>, record: RoundRecord) -> JoinHandle<RoundStatus> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.settle_round(record).await })
    }

    /// Settle a drawn round and persist its final status
    ///
    /// Failures never propagate: the round is marked failed, counted and
    /// listed for reconciliation.
    async fn settle_round(&self, mut record: RoundRecord) -> RoundStatus {
        let mode = record.mode.clone();
        let period = record.period;

        let outcome = match (record.crash_point, record.result) {
            (Some(crash_point), _) => self.settlement.settle_crash(&mode, period, crash_point).await,
            (None, Some(result)) => self.settlement.settle(&mode, period, result).await,
            (None, None) => Err(SettlementError::MissingResult {
                mode: mode.clone(),
                period,
            }),
        };

        let event = match outcome {
            Ok(report) => {
                record.status = RoundStatus::Settled;
                self.failed_rounds.remove(&(mode.clone(), period));
                self.metrics.round_settled(&mode);
                GameEvent::RoundSettled {
                    mode: mode.clone(),
                    period,
                    status: RoundStatus::Settled,
                    wagers: report.resolved(),
                    total_payout: report.total_payout,
                }
            }
            Err(e) => {
                error!(mode = %mode, period = %period, error = %e, "Settlement failed, round flagged");
                record.status = RoundStatus::Failed;
                self.flag_round(&mode, period, e.to_string());
                self.metrics.round_failed(&mode);
                GameEvent::RoundSettled {
                    mode: mode.clone(),
                    period,
                    status: RoundStatus::Failed,
                    wagers: 0,
                    total_payout: 0,
                }
            }
        };

        if let Err(e) = self.store.put_round(&record).await {
            error!(mode = %mode, period = %period, error = %e, "Failed to persist settled round");
            self.flag_round(&mode, period, format!("round status not persisted: {}", e));
        }
        self.hub.publish(event);
        record.status
    }

    fn flag_round(&self, mode: &ModeId, period: PeriodId, reason: String) {
        self.failed_rounds.insert(
            (mode.clone(), period),
            FailedRound {
                mode: mode.clone(),
                period,
                reason,
                flagged_at: Utc::now(),
            },
        );
    }

    /// Drain credits that are due for another attempt
    pub async fn process_retries(&self) -> RetrySummary {
        self.settlement.process_retries(Instant::now()).await
    }

    pub fn heartbeat(&self) {
        self.hub.publish_all(GameEvent::Heartbeat {
            timestamp: Utc::now().timestamp(),
        });
    }

    // ------------------------------------------------------------------
    // Operator controls
    // ------------------------------------------------------------------

    fn discrete_table(&self, mode: &ModeId) -> Result<&Mutex<ModeTable>, OperatorError> {
        match self.modes.get(mode) {
            Some(GameMode::Discrete(table)) => Ok(table),
            Some(GameMode::Crash(_)) => Err(OperatorError::UnsupportedMode(mode.clone())),
            None => Err(OperatorError::UnknownMode(mode.clone())),
        }
    }

    /// Queue the number the open round of `mode` will draw
    pub async fn set_next_result(&self, mode: &ModeId, number: u8) -> Result<PeriodId, OperatorError> {
        let period = self.discrete_table(mode)?.lock().await.queue_operator_number(number)?;
        info!(mode = %mode, period = %period, number, "Operator result queued");
        Ok(period)
    }

    /// Draw `period` right now with `number`
    pub async fn force_draw(self: &Arc<Self>, mode: &ModeId, period: PeriodId, number: u8) -> Result<ForcedDraw, OperatorError> {
        let closed = {
            let mut table = self.discrete_table(mode)?.lock().await;
            let closed = table.force_draw(period, number, Utc::now())?;
            self.hub.set_live(mode, table.live_state());
            closed
        };
        warn!(mode = %mode, period = %period, number, "Round force-drawn by operator");

        let result = closed.selection.result;
        let next_period = closed.next.period;
        let settlement = self.finish_draw(mode, closed).await;
        Ok(ForcedDraw {
            period,
            result,
            next_period,
            settlement,
        })
    }

    /// Stage new settings for the next round of `mode`
    pub async fn update_mode(&self, mode: &ModeId, patch: &ModePatch) -> Result<ModeConfig, OperatorError> {
        let staged = match self.modes.get(mode) {
            Some(GameMode::Discrete(table)) => table.lock().await.stage(patch)?,
            Some(GameMode::Crash(table)) => table.lock().await.stage(patch)?,
            None => return Err(OperatorError::UnknownMode(mode.clone())),
        };
        info!(
            mode = %mode,
            strategy = %staged.strategy,
            min_wager = staged.min_wager,
            max_wager = staged.max_wager,
            lock_secs = staged.lock_secs,
            "Mode settings staged for next round"
        );
        Ok(staged)
    }

    /// Live bucket totals of the open round
    pub async fn live_stakes(&self, mode: &ModeId) -> Result<StakeSnapshot, OperatorError> {
        Ok(self.discrete_table(mode)?.lock().await.stakes())
    }

    pub fn reconciliation(&self) -> ReconciliationReport {
        let mut failed_rounds: Vec<FailedRound> = self.failed_rounds.iter().map(|e| e.value().clone()).collect();
        failed_rounds.sort_by_key(|r| r.flagged_at);
        ReconciliationReport {
            failed_rounds,
            exhausted_credits: self.settlement.retries().exhausted(),
            failed_refunds: self.failed_refunds.iter().map(|e| e.value().clone()).collect(),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn state(&self, mode: &ModeId) -> Option<ModeSnapshot> {
        self.hub.current_state(mode)
    }

    /// Drawn rounds of `mode`, newest first
    pub async fn recent_results(&self, mode: &ModeId, limit: usize) -> Result<Vec<RoundRecord>, StorageError> {
        // A couple of not-yet-drawn rounds can sit at the head
        let mut rounds = self.store.recent_rounds(mode, limit.saturating_add(2)).await?;
        rounds.retain(|r| r.result.is_some() || r.crash_point.is_some());
        rounds.truncate(limit);
        Ok(rounds)
    }

    // ------------------------------------------------------------------
    // Restart recovery
    // ------------------------------------------------------------------

    /// Finish rounds a previous process left behind
    ///
    /// Drawn rounds are settled again (settlement skips finished wagers).
    /// Rounds that never drew are voided and their pending stakes refunded.
    pub async fn recover(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        for mode in &self.order {
            let current = self.current_period(mode).await;
            let rounds = match self.store.unsettled_rounds(mode, self.config.settlement.recovery_scan).await {
                Ok(rounds) => rounds,
                Err(e) => {
                    error!(mode = %mode, error = %e, "Recovery scan failed");
                    continue;
                }
            };

            for record in rounds {
                if Some(record.period) == current {
                    continue;
                }
                let drawn = record.result.is_some() || record.crash_point.is_some();
                if !drawn && record.status == RoundStatus::Failed {
                    // Voided by an earlier recovery
                    continue;
                }
                if drawn {
                    info!(mode = %mode, period = %record.period, "Re-settling round left unsettled");
                    if self.settle_round(record).await == RoundStatus::Settled {
                        report.resettled += 1;
                    }
                } else {
                    report.refunded += self.void_round(record).await;
                    report.voided += 1;
                }
            }
        }
        if report != RecoveryReport::default() {
            info!(
                resettled = report.resettled,
                voided = report.voided,
                refunded = report.refunded,
                "Recovery complete"
            );
        }
        report
    }

    async fn current_period(&self, mode: &ModeId) -> Option<PeriodId> {
        match self.modes.get(mode)? {
            GameMode::Discrete(table) => Some(table.lock().await.round().period),
            GameMode::Crash(table) => Some(table.lock().await.period()),
        }
    }

    async fn void_round(&self, mut record: RoundRecord) -> u32 {
        let mode = record.mode.clone();
        let period = record.period;
        warn!(mode = %mode, period = %period, "Round was never drawn, refunding stakes");

        let pending = match self.store.pending_wagers(&mode, period).await {
            Ok(pending) => pending,
            Err(e) => {
                self.flag_round(&mode, period, format!("void failed: {}", e));
                return 0;
            }
        };

        let mut refunded = 0;
        let mut failed = false;
        for mut wager in pending {
            if wager.status == WagerStatus::AwaitingCredit {
                // Cashed out before the restart; the payout is still owed
                self.settlement.credit_winner(wager, 0, Instant::now()).await;
                continue;
            }
            let reference = format!("refund:{}", wager.id);
            if let Err(e) = self.accounts.credit(&wager.bettor, wager.amount, &reference).await {
                error!(wager_id = %wager.id, error = %e, "Refund of voided wager failed");
                failed = true;
                continue;
            }
            wager.status = WagerStatus::Refunded;
            wager.settled_at = Some(Utc::now());
            if let Err(e) = self.store.put_wager(&wager).await {
                error!(wager_id = %wager.id, error = %e, "Failed to record refunded wager");
                failed = true;
                continue;
            }
            refunded += 1;
        }

        record.status = RoundStatus::Failed;
        record.closed_at = Some(Utc::now());
        let reason = if failed {
            "never drawn; some refunds failed"
        } else {
            "never drawn; stakes refunded"
        };
        self.flag_round(&mode, period, reason.to_string());
        self.metrics.round_failed(&mode);
        if let Err(e) = self.store.put_round(&record).await {
            error!(mode = %mode, period = %period, error = %e, "Failed to persist voided round");
        }
        refunded
    }
}

fn new_wager(id: WagerId, request: &WagerRequest, period: PeriodId, kind: WagerKind) -> Wager {
    Wager {
        id,
        mode: request.mode.clone(),
        period,
        bettor: request.bettor.clone(),
        kind,
        amount: request.amount,
        status: WagerStatus::Pending,
        payout: 0,
        outcome: None,
        placed_at: Utc::now(),
        settled_at: None,
    }
}

/// Assembles a [`GameEngine`] from configuration, with optional collaborator overrides
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn RecordStore>>,
    accounts: Option<Arc<dyn AccountService>>,
    metrics: Option<EngineMetrics>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            accounts: None,
            metrics: None,
        }
    }

    /// Override the record store (useful for testing)
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the account collaborator
    pub fn with_accounts(mut self, accounts: Arc<dyn AccountService>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn build(self) -> RoundhouseResult<Arc<GameEngine>> {
        let config = self.config;
        config.validate()?;

        let store: Arc<dyn RecordStore> = match self.store {
            Some(store) => store,
            None => match config.storage.backend {
                StorageBackend::Memory => Arc::new(MemoryStore::new()),
                StorageBackend::RocksDb => Arc::new(RocksStore::open(&config.storage.data_dir)?),
            },
        };
        let accounts: Arc<dyn AccountService> = match self.accounts {
            Some(accounts) => accounts,
            None => Arc::new(InMemoryAccounts::new(config.accounts.opening_balance)),
        };
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => EngineMetrics::new()?,
        };
        let hub = BroadcastHub::new(config.broadcast.channel_capacity, config.broadcast.history_len);
        let settlement = Arc::new(SettlementEngine::new(
            Arc::clone(&store),
            Arc::clone(&accounts),
            hub.clone(),
            metrics.clone(),
            PayoutTable::from(&config.payouts),
            &config.settlement,
        ));

        let now = Utc::now();
        let mut modes = HashMap::new();
        let mut order = Vec::new();
        let mut openings = Vec::new();

        for (index, mode_config) in config.modes.iter().enumerate() {
            let id = mode_config.id.clone();
            let last_period = store.last_period(&id).await?;
            let rng = match config.rng_seed {
                Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(index as u64)),
                None => StdRng::from_entropy(),
            };

            let history: Vec<RecentResult> = store
                .recent_rounds(&id, config.broadcast.history_len.saturating_add(2))
                .await?
                .iter()
                .filter(|r| r.result.is_some() || r.crash_point.is_some())
                .map(RecentResult::from)
                .collect();

            hub.register_mode(&id, mode_config.kind);
            hub.seed_history(&id, history);

            let game = match mode_config.kind {
                ModeKind::Discrete => {
                    let table = ModeTable::new(mode_config.clone(), last_period, rng, now);
                    hub.set_live(&id, table.live_state());
                    openings.push((id.clone(), Some(table.opening()), table.round().period));
                    GameMode::Discrete(Mutex::new(table))
                }
                ModeKind::Crash => {
                    let table = CrashTable::new(mode_config.clone(), config.crash.clone(), last_period, rng, now);
                    hub.set_live(&id, table.live_state());
                    openings.push((id.clone(), None, table.period()));
                    GameMode::Crash(Mutex::new(table))
                }
            };

            info!(
                mode = %id,
                kind = ?mode_config.kind,
                strategy = %mode_config.strategy,
                resumed_after = ?last_period,
                "Mode registered"
            );
            modes.insert(id.clone(), game);
            order.push(id);
        }

        let engine = Arc::new(GameEngine {
            modes,
            order,
            store,
            accounts,
            hub,
            settlement,
            metrics,
            config,
            failed_rounds: DashMap::new(),
            failed_refunds: DashMap::new(),
            in_flight: DashMap::new(),
        });

        for (mode, opening, period) in openings {
            match opening {
                Some(opening) => engine.announce_opening(&mode, &opening).await,
                None => engine.persist_crash_opening(&mode, period, now).await,
            }
        }
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::types::HouseStrategy;

    async fn engine() -> (Arc<GameEngine>, Arc<InMemoryAccounts>) {
        let accounts = Arc::new(InMemoryAccounts::new(1_000));
        let engine = EngineBuilder::new(EngineConfig::testing())
            .with_accounts(accounts.clone())
            .build()
            .await
            .unwrap();
        (engine, accounts)
    }

    fn request(bettor: &str, bucket: &str, amount: Amount) -> WagerRequest {
        WagerRequest {
            bettor: BettorId::new(bettor),
            mode: ModeId::new("30"),
            period: None,
            bucket: Some(bucket.to_string()),
            amount,
            wager_id: None,
        }
    }

    #[tokio::test]
    async fn test_place_wager_debits_and_records_stake() {
        let (engine, accounts) = engine().await;
        let wager = engine.place_wager(request("alice", "red", 100)).await.unwrap();

        assert_eq!(wager.status, WagerStatus::Pending);
        assert_eq!(wager.bucket(), Some(Bucket::Red));
        assert_eq!(accounts.balance(&BettorId::new("alice")).await.unwrap(), 900);

        let stakes = engine.live_stakes(&ModeId::new("30")).await.unwrap();
        assert_eq!(stakes.get(Bucket::Red).amount, 100);
        assert_eq!(stakes.total_count(), 1);
    }

    #[tokio::test]
    async fn test_rejections_carry_reason_and_do_not_debit() {
        let (engine, accounts) = engine().await;

        let err = engine.place_wager(request("alice", "purple", 100)).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_BUCKET");
        let err = engine.place_wager(request("alice", "red", 5)).await.unwrap_err();
        assert_eq!(err.code(), "BELOW_MINIMUM");
        let err = engine.place_wager(request("alice", "red", 60_000)).await.unwrap_err();
        assert_eq!(err, WagerError::AboveMaximum { amount: 60_000, max: 50_000 });
        let err = engine.place_wager(request("alice", "red", 5_000)).await.unwrap_err();
        assert_eq!(err, WagerError::InsufficientFunds);

        let mut unknown = request("alice", "red", 100);
        unknown.mode = ModeId::new("45");
        assert_eq!(
            engine.place_wager(unknown).await.unwrap_err(),
            WagerError::UnknownMode(ModeId::new("45"))
        );
        assert_eq!(accounts.balance(&BettorId::new("alice")).await.unwrap(), 1_000);
    }

    #[tokio::test]
    async fn test_duplicate_wager_id_is_not_debited_twice() {
        let (engine, accounts) = engine().await;
        let mut req = request("alice", "7", 50);
        req.wager_id = Some(WagerId::new("client-key-1"));

        let first = engine.place_wager(req.clone()).await.unwrap();
        let second = engine.place_wager(req.clone()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(accounts.balance(&BettorId::new("alice")).await.unwrap(), 950);

        req.bettor = BettorId::new("bob");
        assert_eq!(
            engine.place_wager(req).await.unwrap_err(),
            WagerError::DuplicateId(WagerId::new("client-key-1"))
        );
    }

    #[tokio::test]
    async fn test_operator_commands_respect_mode_kind() {
        let (engine, _) = engine().await;
        let aviator = ModeId::new("aviator");

        assert_eq!(
            engine.set_next_result(&aviator, 3).await.unwrap_err(),
            OperatorError::UnsupportedMode(aviator.clone())
        );
        assert!(matches!(
            engine.set_next_result(&ModeId::new("30"), 3).await.unwrap_err(),
            OperatorError::StrategyMismatch { .. }
        ));

        let patch = ModePatch {
            strategy: Some(HouseStrategy::OperatorOverride),
            ..ModePatch::default()
        };
        let staged = engine.update_mode(&ModeId::new("30"), &patch).await.unwrap();
        assert_eq!(staged.strategy, HouseStrategy::OperatorOverride);
        // Staged, not live
        let live = engine.mode_config(&ModeId::new("30")).await.unwrap();
        assert_eq!(live.strategy, HouseStrategy::Adversarial);
    }

    #[tokio::test]
    async fn test_force_draw_settles_and_opens_next_round() {
        let (engine, accounts) = engine().await;
        let mode = ModeId::new("30");
        let wager = engine.place_wager(request("alice", "8", 100)).await.unwrap();

        let forced = engine.force_draw(&mode, wager.period, 8).await.unwrap();
        assert!(forced.next_period > wager.period);
        assert_eq!(forced.settlement.await.unwrap(), RoundStatus::Settled);

        // 1000 - 100 + 900
        assert_eq!(accounts.balance(&BettorId::new("alice")).await.unwrap(), 1_800);
        let state = engine.state(&mode).unwrap();
        assert_eq!(state.recent_results[0].period, wager.period);
        assert_eq!(state.live.unwrap().period, forced.next_period);

        assert_eq!(
            engine.force_draw(&mode, wager.period, 1).await.unwrap_err(),
            OperatorError::Superseded { period: wager.period }
        );
    }

    #[tokio::test]
    async fn test_recover_voids_undrawn_round_and_refunds() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let accounts = Arc::new(InMemoryAccounts::new(1_000));

        let first = EngineBuilder::new(EngineConfig::testing())
            .with_store(store.clone())
            .with_accounts(accounts.clone())
            .build()
            .await
            .unwrap();
        let wager = first.place_wager(request("alice", "green", 200)).await.unwrap();
        drop(first);

        let second = EngineBuilder::new(EngineConfig::testing())
            .with_store(store.clone())
            .with_accounts(accounts.clone())
            .build()
            .await
            .unwrap();
        let report = second.recover().await;
        assert_eq!(report.refunded, 1);
        assert!(report.voided >= 1);

        assert_eq!(accounts.balance(&BettorId::new("alice")).await.unwrap(), 1_000);
        let stored = store
            .load_wager(&wager.mode, wager.period, &wager.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, WagerStatus::Refunded);
        assert!(second
            .reconciliation()
            .failed_rounds
            .iter()
            .any(|r| r.period == wager.period));
    }
}
