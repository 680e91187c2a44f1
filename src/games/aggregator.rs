//! Running stake totals for the open round of a discrete mode

use crate::errors::WagerError;
use crate::games::types::{Amount, Bucket, PeriodId};
use serde::{Serialize, Serializer};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BucketTotal {
    pub amount: Amount,
    pub count: u32,
}

/// Stake ledger scoped to exactly one round
///
/// Owned by the mode table, so every mutation is serialized with the round's
/// own lock and draw transitions.
#[derive(Debug, Clone)]
pub struct StakeBook {
    period: PeriodId,
    totals: [BucketTotal; Bucket::COUNT],
    locked: bool,
}

impl StakeBook {
    pub fn new(period: PeriodId) -> Self {
        Self {
            period,
            totals: [BucketTotal::default(); Bucket::COUNT],
            locked: false,
        }
    }

    pub fn period(&self) -> PeriodId {
        self.period
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Check that a wager for `period` could be recorded right now
    pub fn check(&self, period: PeriodId) -> Result<(), WagerError> {
        if period != self.period {
            return Err(WagerError::PeriodMismatch {
                requested: period,
                current: self.period,
            });
        }
        if self.locked {
            return Err(WagerError::RoundLocked { period });
        }
        Ok(())
    }

    pub fn record(&mut self, period: PeriodId, bucket: Bucket, amount: Amount) -> Result<(), WagerError> {
        self.check(period)?;
        let slot = &mut self.totals[bucket.index()];
        let amount = slot.amount.checked_add(amount).ok_or(WagerError::StakeOverflow)?;
        slot.amount = amount;
        slot.count += 1;
        Ok(())
    }

    /// Undo a `record` whose wager could not be persisted
    pub fn revert(&mut self, bucket: Bucket, amount: Amount) {
        let slot = &mut self.totals[bucket.index()];
        slot.amount = slot.amount.saturating_sub(amount);
        slot.count = slot.count.saturating_sub(1);
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn snapshot(&self) -> StakeSnapshot {
        StakeSnapshot {
            period: self.period,
            totals: self.totals,
        }
    }

    /// Start over for a newly opened round
    pub fn reset(&mut self, period: PeriodId) {
        *self = Self::new(period);
    }
}

/// Immutable copy of a round's bucket totals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeSnapshot {
    period: PeriodId,
    totals: [BucketTotal; Bucket::COUNT],
}

impl StakeSnapshot {
    pub fn empty(period: PeriodId) -> Self {
        StakeBook::new(period).snapshot()
    }

    pub fn period(&self) -> PeriodId {
        self.period
    }

    pub fn get(&self, bucket: Bucket) -> BucketTotal {
        self.totals[bucket.index()]
    }

    pub fn entries(&self) -> impl Iterator<Item = (Bucket, BucketTotal)> + '_ {
        Bucket::ALL.iter().map(move |b| (*b, self.totals[b.index()]))
    }

    pub fn total_amount(&self) -> Amount {
        self.totals.iter().fold(0u64, |acc, t| acc.saturating_add(t.amount))
    }

    pub fn total_count(&self) -> u32 {
        self.totals.iter().map(|t| t.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.iter().all(|t| t.count == 0)
    }
}

#[derive(Serialize)]
struct BucketStakeView {
    bucket: Bucket,
    amount: Amount,
    count: u32,
}

#[derive(Serialize)]
struct SnapshotView {
    period: PeriodId,
    total_amount: Amount,
    total_count: u32,
    buckets: Vec<BucketStakeView>,
}

impl Serialize for StakeSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SnapshotView {
            period: self.period,
            total_amount: self.total_amount(),
            total_count: self.total_count(),
            buckets: self
                .entries()
                .map(|(bucket, total)| BucketStakeView {
                    bucket,
                    amount: total.amount,
                    count: total.count,
                })
                .collect(),
        }
        .serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: PeriodId = PeriodId::new(20240101000000);

    #[test]
    fn test_totals_match_recorded_wagers() {
        let mut book = StakeBook::new(PERIOD);
        let wagers = [
            (Bucket::Red, 100),
            (Bucket::Green, 50),
            (Bucket::Red, 25),
            (Bucket::Number(7), 10),
            (Bucket::Big, 40),
        ];
        for (bucket, amount) in wagers {
            book.record(PERIOD, bucket, amount).unwrap();
        }

        let snapshot = book.snapshot();
        let expected: u64 = wagers.iter().map(|(_, a)| a).sum();
        assert_eq!(snapshot.total_amount(), expected);
        assert_eq!(snapshot.total_count(), 5);
        assert_eq!(snapshot.get(Bucket::Red), BucketTotal { amount: 125, count: 2 });
        assert_eq!(snapshot.get(Bucket::Violet), BucketTotal::default());
    }

    #[test]
    fn test_rejects_wrong_period_and_locked_round() {
        let mut book = StakeBook::new(PERIOD);
        let err = book.record(PERIOD.next(), Bucket::Red, 10).unwrap_err();
        assert!(matches!(err, WagerError::PeriodMismatch { .. }));

        book.lock();
        let err = book.record(PERIOD, Bucket::Red, 10).unwrap_err();
        assert_eq!(err, WagerError::RoundLocked { period: PERIOD });
        assert!(book.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_is_detached_from_book() {
        let mut book = StakeBook::new(PERIOD);
        book.record(PERIOD, Bucket::Small, 30).unwrap();
        let snapshot = book.snapshot();
        book.record(PERIOD, Bucket::Small, 30).unwrap();

        assert_eq!(snapshot.get(Bucket::Small).amount, 30);
        assert_eq!(book.snapshot().get(Bucket::Small).amount, 60);
    }

    #[test]
    fn test_revert_and_reset() {
        let mut book = StakeBook::new(PERIOD);
        book.record(PERIOD, Bucket::Number(3), 70).unwrap();
        book.revert(Bucket::Number(3), 70);
        assert!(book.snapshot().is_empty());

        book.lock();
        book.reset(PERIOD.next());
        assert!(!book.is_locked());
        assert_eq!(book.period(), PERIOD.next());
    }

    #[test]
    fn test_overflow_is_rejected() {
        let mut book = StakeBook::new(PERIOD);
        book.record(PERIOD, Bucket::Red, u64::MAX).unwrap();
        assert_eq!(
            book.record(PERIOD, Bucket::Red, 1),
            Err(WagerError::StakeOverflow)
        );
        assert_eq!(book.snapshot().get(Bucket::Red).count, 1);
    }
}
