//! Settlement pipeline
//!
//! Resolves every unfinished wager of a round exactly once. A wager is written as
//! `awaiting_credit` before its payout is requested and only becomes `won` once
//! the credit succeeds, so a replayed settlement or a restart can always tell
//! which credits are still owed. Credits carry the reference `payout:{wager_id}`
//! and the wallet ignores repeats, so a retry can never pay twice.

use crate::accounts::AccountService;
use crate::broadcast::{BroadcastHub, GameEvent};
use crate::config::{PayoutConfig, SettlementConfig};
use crate::errors::SettlementError;
use crate::games::types::{
    Amount, Bucket, BucketKind, DrawResult, ModeId, Multiplier, PeriodId, Wager, WagerId,
    WagerStatus,
};
use crate::metrics::EngineMetrics;
use crate::store::RecordStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Win multipliers by bucket class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayoutTable {
    pub number: Multiplier,
    pub color: Multiplier,
    pub size: Multiplier,
}

impl PayoutTable {
    pub fn multiplier(&self, bucket: Bucket) -> Multiplier {
        match bucket.kind() {
            BucketKind::Number => self.number,
            BucketKind::Color => self.color,
            BucketKind::Size => self.size,
        }
    }

    /// Payout for a discrete wager; zero when the bucket lost
    pub fn payout(&self, bucket: Bucket, amount: Amount, result: &DrawResult) -> Amount {
        if bucket.wins(result) {
            self.multiplier(bucket).apply(amount)
        } else {
            0
        }
    }
}

impl Default for PayoutTable {
    fn default() -> Self {
        Self::from(&PayoutConfig::default())
    }
}

impl From<&PayoutConfig> for PayoutTable {
    fn from(config: &PayoutConfig) -> Self {
        Self {
            number: Multiplier::from_bp(config.number_bp),
            color: Multiplier::from_bp(config.color_bp),
            size: Multiplier::from_bp(config.size_bp),
        }
    }
}

/// What a round resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Draw(DrawResult),
    Crash(Multiplier),
}

/// Stable pointer to a stored wager
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WagerRef {
    pub mode: ModeId,
    pub period: PeriodId,
    pub wager_id: WagerId,
}

impl From<&Wager> for WagerRef {
    fn from(wager: &Wager) -> Self {
        Self {
            mode: wager.mode.clone(),
            period: wager.period,
            wager_id: wager.id.clone(),
        }
    }
}

/// A credit that ran out of retries
#[derive(Debug, Clone, Serialize)]
pub struct ExhaustedCredit {
    #[serde(flatten)]
    pub wager: WagerRef,
    pub payout: Amount,
    pub attempts: u32,
    pub last_error: String,
    pub flagged_at: DateTime<Utc>,
}

struct RetryEntry {
    wager: WagerRef,
    attempts: u32,
    due: Instant,
}

/// Failed credits waiting for another attempt, with exponential backoff
pub struct RetryQueue {
    entries: DashMap<WagerId, RetryEntry>,
    exhausted: DashMap<WagerId, ExhaustedCredit>,
    base: Duration,
    max_attempts: u32,
}

impl RetryQueue {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            entries: DashMap::new(),
            exhausted: DashMap::new(),
            base,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay after the `attempts`-th failed attempt
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exponent)
    }

    /// Record a failed attempt. Returns false once the wager has run out of attempts.
    fn record_failure(
        &self,
        wager: WagerRef,
        payout: Amount,
        attempts: u32,
        now: Instant,
        error: String,
    ) -> bool {
        if attempts >= self.max_attempts {
            self.entries.remove(&wager.wager_id);
            self.exhausted.insert(
                wager.wager_id.clone(),
                ExhaustedCredit {
                    wager,
                    payout,
                    attempts,
                    last_error: error,
                    flagged_at: Utc::now(),
                },
            );
            return false;
        }
        self.entries.insert(
            wager.wager_id.clone(),
            RetryEntry {
                wager,
                attempts,
                due: now + self.backoff(attempts),
            },
        );
        true
    }

    /// Remove and return every entry due at `now`
    fn take_due(&self, now: Instant) -> Vec<(WagerRef, u32)> {
        let due: Vec<WagerId> = self
            .entries
            .iter()
            .filter(|e| e.due <= now)
            .map(|e| e.key().clone())
            .collect();
        due.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .map(|(_, entry)| (entry.wager, entry.attempts))
            .collect()
    }

    pub fn contains(&self, id: &WagerId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn exhausted(&self) -> Vec<ExhaustedCredit> {
        let mut list: Vec<ExhaustedCredit> = self.exhausted.iter().map(|e| e.value().clone()).collect();
        list.sort_by(|a, b| a.flagged_at.cmp(&b.flagged_at));
        list
    }
}

/// Counts from one settlement pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SettlementReport {
    pub won: u32,
    pub lost: u32,
    pub awaiting_credit: u32,
    pub total_payout: Amount,
}

impl SettlementReport {
    pub fn resolved(&self) -> u32 {
        self.won + self.lost + self.awaiting_credit
    }
}

/// Counts from one retry pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub attempted: u32,
    pub credited: u32,
    pub exhausted: u32,
}

pub struct SettlementEngine {
    store: Arc<dyn RecordStore>,
    accounts: Arc<dyn AccountService>,
    hub: BroadcastHub,
    metrics: EngineMetrics,
    payouts: PayoutTable,
    retries: RetryQueue,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        accounts: Arc<dyn AccountService>,
        hub: BroadcastHub,
        metrics: EngineMetrics,
        payouts: PayoutTable,
        config: &SettlementConfig,
    ) -> Self {
        Self {
            store,
            accounts,
            hub,
            metrics,
            payouts,
            retries: RetryQueue::new(config.retry_base(), config.max_attempts),
        }
    }

    pub fn payouts(&self) -> &PayoutTable {
        &self.payouts
    }

    pub fn retries(&self) -> &RetryQueue {
        &self.retries
    }

    /// Resolve every unfinished wager of a discrete round against `result`
    pub async fn settle(
        &self,
        mode: &ModeId,
        period: PeriodId,
        result: DrawResult,
    ) -> Result<SettlementReport, SettlementError> {
        self.resolve_round(mode, period, RoundOutcome::Draw(result)).await
    }

    /// Resolve a crashed round: wagers that never cashed out lose their stake
    pub async fn settle_crash(
        &self,
        mode: &ModeId,
        period: PeriodId,
        crash_point: Multiplier,
    ) -> Result<SettlementReport, SettlementError> {
        self.resolve_round(mode, period, RoundOutcome::Crash(crash_point)).await
    }

    async fn resolve_round(
        &self,
        mode: &ModeId,
        period: PeriodId,
        outcome: RoundOutcome,
    ) -> Result<SettlementReport, SettlementError> {
        let pending = self.store.pending_wagers(mode, period).await?;
        let mut report = SettlementReport::default();
        let mut failed = 0u32;
        let now = Instant::now();

        debug!(mode = %mode, period = %period, wagers = pending.len(), "Settling round");

        for mut wager in pending {
            if wager.status == WagerStatus::AwaitingCredit {
                // Already decided; the credit is owed from an earlier pass
                if !self.retries.contains(&wager.id) {
                    self.record_credit_outcome(&mut report, self.credit_winner(wager, 0, now).await);
                } else {
                    report.awaiting_credit += 1;
                }
                continue;
            }

            let payout = match (outcome, wager.bucket()) {
                (RoundOutcome::Draw(result), Some(bucket)) => {
                    wager.outcome = Some(result);
                    self.payouts.payout(bucket, wager.amount, &result)
                }
                (RoundOutcome::Crash(_), None) => wager
                    .cashed_out_at()
                    .map(|m| m.apply(wager.amount))
                    .unwrap_or(0),
                _ => {
                    warn!(wager_id = %wager.id, mode = %mode, "Wager kind does not match round kind");
                    0
                }
            };

            wager.payout = payout;
            if payout == 0 {
                wager.status = WagerStatus::Lost;
                wager.settled_at = Some(Utc::now());
                if let Err(e) = self.store.put_wager(&wager).await {
                    error!(wager_id = %wager.id, error = %e, "Failed to record lost wager");
                    failed += 1;
                    continue;
                }
                report.lost += 1;
                self.notify(&wager);
                continue;
            }

            wager.status = WagerStatus::AwaitingCredit;
            if let Err(e) = self.store.put_wager(&wager).await {
                error!(wager_id = %wager.id, error = %e, "Failed to record winning wager");
                failed += 1;
                continue;
            }
            self.record_credit_outcome(&mut report, self.credit_winner(wager, 0, now).await);
        }

        info!(
            mode = %mode,
            period = %period,
            won = report.won,
            lost = report.lost,
            awaiting_credit = report.awaiting_credit,
            total_payout = report.total_payout,
            failed,
            "Round settled"
        );

        if failed > 0 {
            return Err(SettlementError::Incomplete { period, failed });
        }
        Ok(report)
    }

    fn record_credit_outcome(&self, report: &mut SettlementReport, outcome: CreditOutcome) {
        match outcome {
            CreditOutcome::Credited(payout) => {
                report.won += 1;
                report.total_payout = report.total_payout.saturating_add(payout);
            }
            CreditOutcome::Queued | CreditOutcome::Exhausted => report.awaiting_credit += 1,
        }
    }

    /// Pay out a wager that is already stored as `awaiting_credit`
    ///
    /// `attempts` is the number of earlier failed attempts. A wager that cashed
    /// out of a running crash round goes through here directly.
    pub async fn credit_winner(&self, mut wager: Wager, attempts: u32, now: Instant) -> CreditOutcome {
        let reference = format!("payout:{}", wager.id);
        match self.accounts.credit(&wager.bettor, wager.payout, &reference).await {
            Ok(()) => {
                wager.status = WagerStatus::Won;
                wager.settled_at = Some(Utc::now());
                if let Err(e) = self.store.put_wager(&wager).await {
                    // Credit is applied; replaying it later is a no-op
                    warn!(wager_id = %wager.id, error = %e, "Credited wager could not be marked won");
                }
                self.metrics.payout(&wager.mode, wager.payout);
                self.notify(&wager);
                CreditOutcome::Credited(wager.payout)
            }
            Err(e) => {
                let attempts = attempts + 1;
                if self
                    .retries
                    .record_failure(WagerRef::from(&wager), wager.payout, attempts, now, e.to_string())
                {
                    warn!(
                        wager_id = %wager.id,
                        bettor = %wager.bettor,
                        attempts,
                        retry_in_ms = self.retries.backoff(attempts).as_millis() as u64,
                        error = %e,
                        "Credit failed, queued for retry"
                    );
                    self.metrics.credit_retry("queued");
                    CreditOutcome::Queued
                } else {
                    error!(
                        wager_id = %wager.id,
                        bettor = %wager.bettor,
                        attempts,
                        error = %e,
                        "Credit retries exhausted, flagged for reconciliation"
                    );
                    self.metrics.credit_retry("exhausted");
                    CreditOutcome::Exhausted
                }
            }
        }
    }

    /// Retry every queued credit that is due at `now`
    pub async fn process_retries(&self, now: Instant) -> RetrySummary {
        let mut summary = RetrySummary::default();
        for (wager_ref, attempts) in self.retries.take_due(now) {
            let wager = match self
                .store
                .load_wager(&wager_ref.mode, wager_ref.period, &wager_ref.wager_id)
                .await
            {
                Ok(Some(w)) if w.status == WagerStatus::AwaitingCredit => w,
                Ok(_) => continue,
                Err(e) => {
                    warn!(wager_id = %wager_ref.wager_id, error = %e, "Retry could not load wager");
                    if !self.retries.record_failure(wager_ref, 0, attempts + 1, now, e.to_string()) {
                        summary.exhausted += 1;
                    }
                    continue;
                }
            };

            summary.attempted += 1;
            match self.credit_winner(wager, attempts, now).await {
                CreditOutcome::Credited(_) => {
                    self.metrics.credit_retry("credited");
                    summary.credited += 1;
                }
                CreditOutcome::Queued => {}
                CreditOutcome::Exhausted => summary.exhausted += 1,
            }
        }
        summary
    }

    fn notify(&self, wager: &Wager) {
        self.hub.notify(
            &wager.bettor,
            GameEvent::WagerSettled {
                mode: wager.mode.clone(),
                period: wager.period,
                wager_id: wager.id.clone(),
                status: wager.status,
                payout: wager.payout,
                outcome: wager.outcome,
            },
        );
    }
}

/// Result of one credit attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Credited(Amount),
    Queued,
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::InMemoryAccounts;
    use crate::errors::AccountError;
    use crate::games::types::{BettorId, WagerKind};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const PERIOD: PeriodId = PeriodId::new(20240101000000);

    /// Wallet whose first `failures` credits fail
    struct FlakyAccounts {
        inner: InMemoryAccounts,
        failures: AtomicU32,
    }

    #[async_trait]
    impl AccountService for FlakyAccounts {
        async fn balance(&self, bettor: &BettorId) -> Result<Amount, AccountError> {
            self.inner.balance(bettor).await
        }

        async fn debit(&self, bettor: &BettorId, amount: Amount, reference: &str) -> Result<(), AccountError> {
            self.inner.debit(bettor, amount, reference).await
        }

        async fn credit(&self, bettor: &BettorId, amount: Amount, reference: &str) -> Result<(), AccountError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(AccountError::Unavailable("wallet offline".to_string()));
            }
            self.inner.credit(bettor, amount, reference).await
        }
    }

    fn wager(id: &str, bettor: &str, bucket: Bucket, amount: Amount) -> Wager {
        Wager {
            id: WagerId::new(id),
            mode: ModeId::new("30"),
            period: PERIOD,
            bettor: BettorId::new(bettor),
            kind: WagerKind::Discrete { bucket },
            amount,
            status: WagerStatus::Pending,
            payout: 0,
            outcome: None,
            placed_at: Utc::now(),
            settled_at: None,
        }
    }

    fn engine(store: Arc<MemoryStore>, accounts: Arc<dyn AccountService>, attempts: u32) -> SettlementEngine {
        let config = SettlementConfig {
            retry_base_ms: 500,
            max_attempts: attempts,
            ..SettlementConfig::default()
        };
        SettlementEngine::new(
            store,
            accounts,
            BroadcastHub::new(16, 10),
            EngineMetrics::new().unwrap(),
            PayoutTable::default(),
            &config,
        )
    }

    #[test]
    fn test_payout_table() {
        let table = PayoutTable::default();
        let seven = DrawResult::from_number(7).unwrap();
        assert_eq!(table.payout(Bucket::Number(7), 100, &seven), 900);
        assert_eq!(table.payout(Bucket::Green, 100, &seven), 198);
        assert_eq!(table.payout(Bucket::Big, 100, &seven), 198);
        assert_eq!(table.payout(Bucket::Red, 100, &seven), 0);
        assert_eq!(table.payout(Bucket::Number(3), 100, &seven), 0);

        let custom = PayoutTable::from(&PayoutConfig {
            number_bp: 90_000,
            color_bp: 19_000,
            size_bp: 19_000,
        });
        assert_eq!(custom.payout(Bucket::Small, 100, &DrawResult::from_number(2).unwrap()), 190);
    }

    #[test]
    fn test_backoff_doubles() {
        let queue = RetryQueue::new(Duration::from_millis(500), 8);
        assert_eq!(queue.backoff(1), Duration::from_millis(500));
        assert_eq!(queue.backoff(2), Duration::from_millis(1_000));
        assert_eq!(queue.backoff(4), Duration::from_millis(4_000));
    }

    #[tokio::test]
    async fn test_settle_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let accounts = Arc::new(InMemoryAccounts::new(0));
        let settlement = engine(store.clone(), accounts.clone(), 8);

        store.put_wager(&wager("w1", "alice", Bucket::Number(4), 100)).await.unwrap();
        store.put_wager(&wager("w2", "bob", Bucket::Green, 100)).await.unwrap();
        store.put_wager(&wager("w3", "carol", Bucket::Red, 50)).await.unwrap();

        let four = DrawResult::from_number(4).unwrap();
        let mode = ModeId::new("30");
        let first = settlement.settle(&mode, PERIOD, four).await.unwrap();
        assert_eq!(first.won, 2);
        assert_eq!(first.lost, 1);
        assert_eq!(first.total_payout, 900 + 99);

        let second = settlement.settle(&mode, PERIOD, four).await.unwrap();
        assert_eq!(second, SettlementReport::default());

        assert_eq!(accounts.balance(&BettorId::new("alice")).await.unwrap(), 900);
        assert_eq!(accounts.balance(&BettorId::new("carol")).await.unwrap(), 99);
        let bob = store.find_wager(&WagerId::new("w2")).await.unwrap().unwrap();
        assert_eq!(bob.status, WagerStatus::Lost);
        assert_eq!(bob.outcome, Some(four));
    }

    #[tokio::test]
    async fn test_failed_credit_is_retried_without_blocking_others() {
        let store = Arc::new(MemoryStore::new());
        let accounts = Arc::new(FlakyAccounts {
            inner: InMemoryAccounts::new(0),
            failures: AtomicU32::new(1),
        });
        let settlement = engine(store.clone(), accounts.clone(), 8);

        store.put_wager(&wager("w1", "alice", Bucket::Violet, 100)).await.unwrap();
        store.put_wager(&wager("w2", "bob", Bucket::Small, 100)).await.unwrap();

        let zero = DrawResult::from_number(0).unwrap();
        let report = settlement.settle(&ModeId::new("30"), PERIOD, zero).await.unwrap();
        assert_eq!(report.won + report.awaiting_credit, 2);
        assert_eq!(report.awaiting_credit, 1);
        assert_eq!(settlement.retries().len(), 1);

        // Not due yet
        let start = Instant::now();
        assert_eq!(settlement.process_retries(start).await.attempted, 0);

        let summary = settlement
            .process_retries(start + Duration::from_secs(1))
            .await;
        assert_eq!(summary.credited, 1);
        assert!(settlement.retries().is_empty());

        for id in ["w1", "w2"] {
            let stored = store.find_wager(&WagerId::new(id)).await.unwrap().unwrap();
            assert_eq!(stored.status, WagerStatus::Won);
            assert_eq!(stored.payout, 198);
        }
    }

    #[tokio::test]
    async fn test_retries_exhaust_into_reconciliation() {
        let store = Arc::new(MemoryStore::new());
        let accounts = Arc::new(FlakyAccounts {
            inner: InMemoryAccounts::new(0),
            failures: AtomicU32::new(100),
        });
        let settlement = engine(store.clone(), accounts, 2);

        store.put_wager(&wager("w1", "alice", Bucket::Number(9), 10)).await.unwrap();
        let nine = DrawResult::from_number(9).unwrap();
        settlement.settle(&ModeId::new("30"), PERIOD, nine).await.unwrap();

        let later = Instant::now() + Duration::from_secs(60);
        let summary = settlement.process_retries(later).await;
        assert_eq!(summary.exhausted, 1);

        let flagged = settlement.retries().exhausted();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].payout, 90);
        let stored = store.find_wager(&WagerId::new("w1")).await.unwrap().unwrap();
        assert_eq!(stored.status, WagerStatus::AwaitingCredit);
    }

    #[tokio::test]
    async fn test_crash_settlement_loses_uncashed_wagers() {
        let store = Arc::new(MemoryStore::new());
        let accounts = Arc::new(InMemoryAccounts::new(0));
        let settlement = engine(store.clone(), accounts, 8);

        let mut crash = wager("c1", "dave", Bucket::Red, 100);
        crash.mode = ModeId::new("aviator");
        crash.kind = WagerKind::Crash { cashed_out_at: None };
        store.put_wager(&crash).await.unwrap();

        let report = settlement
            .settle_crash(&ModeId::new("aviator"), PERIOD, Multiplier::from_bp(25_000))
            .await
            .unwrap();
        assert_eq!(report.lost, 1);
        let stored = store.find_wager(&WagerId::new("c1")).await.unwrap().unwrap();
        assert_eq!(stored.status, WagerStatus::Lost);
        assert_eq!(stored.payout, 0);
    }
}
