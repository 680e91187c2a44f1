//! Discrete round state for one mode
//!
//! `ModeTable` is the single writer for its mode: the open round, its stake book
//! and the queued operator number all live here, behind one lock owned by the
//! engine. Draws never wait on settlement; the next round opens in the same call.

use crate::broadcast::{LiveState, RoundPhase};
use crate::config::{ModeConfig, ModePatch};
use crate::errors::{OperatorError, WagerError};
use crate::games::aggregator::{StakeBook, StakeSnapshot};
use crate::games::period::PeriodSequence;
use crate::games::selector::{self, Selection};
use crate::games::types::{
    Amount, Bucket, DrawResult, HouseStrategy, PeriodId, SelectionSource,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;

/// The round currently accepting (or about to stop accepting) wagers
#[derive(Debug, Clone)]
pub struct OpenRound {
    pub period: PeriodId,
    pub opened_at: DateTime<Utc>,
    pub remaining_secs: u64,
    pub book: StakeBook,
    pub operator_number: Option<u8>,
}

/// A freshly opened round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOpening {
    pub period: PeriodId,
    pub opened_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub closes_at: DateTime<Utc>,
}

/// A round that has just been drawn, plus the round that replaced it
#[derive(Debug, Clone)]
pub struct ClosedRound {
    pub period: PeriodId,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub snapshot: StakeSnapshot,
    pub selection: Selection,
    pub next: RoundOpening,
}

#[derive(Debug, Clone)]
pub enum TickOutcome {
    Countdown {
        period: PeriodId,
        remaining_secs: u64,
        locked: bool,
    },
    /// Lock threshold reached; the snapshot is final for this round
    Locked {
        period: PeriodId,
        opened_at: DateTime<Utc>,
        remaining_secs: u64,
        snapshot: StakeSnapshot,
    },
    Drawn(ClosedRound),
}

pub struct ModeTable {
    config: ModeConfig,
    staged: Option<ModeConfig>,
    sequence: PeriodSequence,
    round: OpenRound,
    rng: StdRng,
}

impl ModeTable {
    /// Open the first round, continuing after `last_period` if one was persisted
    pub fn new(config: ModeConfig, last_period: Option<PeriodId>, rng: StdRng, now: DateTime<Utc>) -> Self {
        let mut sequence = PeriodSequence::resume(last_period);
        let period = sequence.next_at(now);
        let round = OpenRound {
            period,
            opened_at: now,
            remaining_secs: config.duration_secs,
            book: StakeBook::new(period),
            operator_number: None,
        };
        Self {
            config,
            staged: None,
            sequence,
            round,
            rng,
        }
    }

    pub fn config(&self) -> &ModeConfig {
        &self.config
    }

    pub fn staged(&self) -> Option<&ModeConfig> {
        self.staged.as_ref()
    }

    pub fn round(&self) -> &OpenRound {
        &self.round
    }

    pub fn opening(&self) -> RoundOpening {
        opening_of(&self.round, self.config.duration_secs)
    }

    /// Advance the clock by one second
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        self.round.remaining_secs = self.round.remaining_secs.saturating_sub(1);
        let remaining = self.round.remaining_secs;

        if remaining == 0 {
            return TickOutcome::Drawn(self.draw(now, None));
        }
        if remaining <= self.config.lock_secs && !self.round.book.is_locked() {
            self.round.book.lock();
            return TickOutcome::Locked {
                period: self.round.period,
                opened_at: self.round.opened_at,
                remaining_secs: remaining,
                snapshot: self.round.book.snapshot(),
            };
        }
        TickOutcome::Countdown {
            period: self.round.period,
            remaining_secs: remaining,
            locked: self.round.book.is_locked(),
        }
    }

    /// Draw the open round now with `number`, unless it has already been drawn
    pub fn force_draw(&mut self, period: PeriodId, number: u8, now: DateTime<Utc>) -> Result<ClosedRound, OperatorError> {
        if number > 9 {
            return Err(OperatorError::InvalidNumber(number));
        }
        if period != self.round.period {
            return Err(OperatorError::Superseded { period });
        }
        Ok(self.draw(now, Some(number)))
    }

    fn draw(&mut self, now: DateTime<Utc>, forced: Option<u8>) -> ClosedRound {
        self.round.book.lock();
        let snapshot = self.round.book.snapshot();
        let selection = match forced.and_then(DrawResult::from_number) {
            Some(result) => Selection {
                result,
                source: SelectionSource::Forced,
            },
            None => selector::select(
                self.config.strategy,
                &snapshot,
                self.round.operator_number,
                &mut self.rng,
            ),
        };

        let closed_period = self.round.period;
        let closed_opened_at = self.round.opened_at;
        let next = self.open_next(now);

        ClosedRound {
            period: closed_period,
            opened_at: closed_opened_at,
            closed_at: now,
            snapshot,
            selection,
            next,
        }
    }

    fn open_next(&mut self, now: DateTime<Utc>) -> RoundOpening {
        if let Some(staged) = self.staged.take() {
            self.config = staged;
        }
        let period = self.sequence.next_at(now);
        self.round = OpenRound {
            period,
            opened_at: now,
            remaining_secs: self.config.duration_secs,
            book: StakeBook::new(period),
            operator_number: None,
        };
        self.opening()
    }

    pub fn check_open(&self, period: PeriodId) -> Result<(), WagerError> {
        self.round.book.check(period)
    }

    pub fn validate_amount(&self, amount: Amount) -> Result<(), WagerError> {
        validate_amount(&self.config, amount)
    }

    pub fn record(&mut self, period: PeriodId, bucket: Bucket, amount: Amount) -> Result<(), WagerError> {
        self.round.book.record(period, bucket, amount)
    }

    /// Take back a recorded stake whose wager could not be persisted
    pub fn revert(&mut self, period: PeriodId, bucket: Bucket, amount: Amount) {
        if self.round.period == period {
            self.round.book.revert(bucket, amount);
        }
    }

    pub fn stakes(&self) -> StakeSnapshot {
        self.round.book.snapshot()
    }

    /// Queue the number the open round will draw
    pub fn queue_operator_number(&mut self, number: u8) -> Result<PeriodId, OperatorError> {
        if number > 9 {
            return Err(OperatorError::InvalidNumber(number));
        }
        if self.config.strategy != HouseStrategy::OperatorOverride {
            return Err(OperatorError::StrategyMismatch {
                mode: self.config.id.clone(),
                strategy: self.config.strategy,
            });
        }
        self.round.operator_number = Some(number);
        Ok(self.round.period)
    }

    /// Stage a settings change for the next round
    pub fn stage(&mut self, patch: &ModePatch) -> Result<ModeConfig, OperatorError> {
        let base = self.staged.as_ref().unwrap_or(&self.config);
        let next = patch
            .apply(base)
            .map_err(|e| OperatorError::InvalidSettings(e.to_string()))?;
        self.staged = Some(next.clone());
        Ok(next)
    }

    pub fn live_state(&self) -> LiveState {
        LiveState {
            period: self.round.period,
            phase: if self.round.book.is_locked() {
                RoundPhase::Locked
            } else {
                RoundPhase::Open
            },
            remaining_secs: Some(self.round.remaining_secs),
            duration_secs: Some(self.config.duration_secs),
            multiplier: None,
        }
    }
}

fn opening_of(round: &OpenRound, duration_secs: u64) -> RoundOpening {
    RoundOpening {
        period: round.period,
        opened_at: round.opened_at,
        duration_secs,
        closes_at: round.opened_at + ChronoDuration::seconds(duration_secs as i64),
    }
}

pub(crate) fn validate_amount(config: &ModeConfig, amount: Amount) -> Result<(), WagerError> {
    if amount < config.min_wager {
        return Err(WagerError::BelowMinimum {
            amount,
            min: config.min_wager,
        });
    }
    if amount > config.max_wager {
        return Err(WagerError::AboveMaximum {
            amount,
            max: config.max_wager,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::SeedableRng;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn table(duration: u64, strategy: HouseStrategy) -> ModeTable {
        let config = ModeConfig::discrete("30", duration).with_strategy(strategy);
        ModeTable::new(config, None, StdRng::seed_from_u64(5), start())
    }

    fn run_until_drawn(table: &mut ModeTable, mut now: DateTime<Utc>) -> ClosedRound {
        loop {
            now += ChronoDuration::seconds(1);
            if let TickOutcome::Drawn(closed) = table.tick(now) {
                return closed;
            }
        }
    }

    #[test]
    fn test_lock_then_draw_then_next_round() {
        let mut table = table(10, HouseStrategy::Adversarial);
        let first = table.round().period;
        let mut now = start();

        for expected in (6..=9).rev() {
            now += ChronoDuration::seconds(1);
            match table.tick(now) {
                TickOutcome::Countdown { remaining_secs, locked, .. } => {
                    assert_eq!(remaining_secs, expected);
                    assert!(!locked);
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        now += ChronoDuration::seconds(1);
        assert!(matches!(table.tick(now), TickOutcome::Locked { remaining_secs: 5, .. }));
        assert_eq!(
            table.check_open(first),
            Err(WagerError::RoundLocked { period: first })
        );

        let closed = run_until_drawn(&mut table, now);
        assert_eq!(closed.period, first);
        assert!(closed.next.period > first);
        assert_eq!(table.round().period, closed.next.period);
        assert_eq!(table.round().remaining_secs, 10);
        assert!(table.check_open(closed.next.period).is_ok());
    }

    #[test]
    fn test_snapshot_at_draw_contains_accepted_wagers() {
        let mut table = table(10, HouseStrategy::Adversarial);
        let period = table.round().period;
        table.record(period, Bucket::Red, 100).unwrap();
        table.record(period, Bucket::Green, 50).unwrap();

        let closed = run_until_drawn(&mut table, start());
        assert_eq!(closed.snapshot.total_amount(), 150);
        assert_eq!(closed.selection.source, SelectionSource::Adversarial);
        assert!(table.stakes().is_empty());
    }

    #[test]
    fn test_operator_number_requires_override_strategy() {
        let mut adversarial = table(10, HouseStrategy::Adversarial);
        assert!(matches!(
            adversarial.queue_operator_number(3),
            Err(OperatorError::StrategyMismatch { .. })
        ));

        let mut table = table(10, HouseStrategy::OperatorOverride);
        assert_eq!(table.queue_operator_number(12), Err(OperatorError::InvalidNumber(12)));
        table.queue_operator_number(3).unwrap();
        let closed = run_until_drawn(&mut table, start());
        assert_eq!(closed.selection.result.number(), 3);
        assert_eq!(closed.selection.source, SelectionSource::Operator);
        assert_eq!(table.round().operator_number, None);
    }

    #[test]
    fn test_force_draw_loser_is_superseded() {
        let mut table = table(10, HouseStrategy::Adversarial);
        let period = table.round().period;

        let forced = table.force_draw(period, 8, start()).unwrap();
        assert_eq!(forced.selection.result.number(), 8);
        assert_eq!(forced.selection.source, SelectionSource::Forced);

        assert_eq!(
            table.force_draw(period, 2, start()).unwrap_err(),
            OperatorError::Superseded { period }
        );
    }

    #[test]
    fn test_staged_settings_apply_next_round() {
        let mut table = table(10, HouseStrategy::Adversarial);
        let patch = ModePatch {
            max_wager: Some(500),
            ..ModePatch::default()
        };
        table.stage(&patch).unwrap();
        assert!(table.validate_amount(1_000).is_ok());

        run_until_drawn(&mut table, start());
        assert_eq!(
            table.validate_amount(1_000),
            Err(WagerError::AboveMaximum { amount: 1_000, max: 500 })
        );
        assert!(table.staged().is_none());
    }

    #[test]
    fn test_periods_increase_across_rounds() {
        let mut table = table(2, HouseStrategy::UniformRandom);
        let mut last = table.round().period;
        let mut now = start();
        for _ in 0..20 {
            let closed = run_until_drawn(&mut table, now);
            now = closed.closed_at;
            assert!(closed.next.period > last);
            last = closed.next.period;
        }
    }
}
