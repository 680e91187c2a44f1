//! Result selection for discrete rounds
//!
//! The adversarial strategy draws from the least-staked bucket, which keeps the
//! round's total payout as low as the bucket structure allows.

use crate::games::aggregator::StakeSnapshot;
use crate::games::types::{Bucket, DrawResult, HouseStrategy, SelectionSource};
use rand::seq::SliceRandom;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub result: DrawResult,
    pub source: SelectionSource,
}

/// Pick the result for a round
///
/// `operator_number` is honoured only under [`HouseStrategy::OperatorOverride`];
/// without one that strategy falls back to adversarial selection.
pub fn select<R: Rng + ?Sized>(
    strategy: HouseStrategy,
    snapshot: &StakeSnapshot,
    operator_number: Option<u8>,
    rng: &mut R,
) -> Selection {
    match (strategy, operator_number) {
        (HouseStrategy::UniformRandom, _) => Selection {
            result: DrawResult::from_digit(uniform_number(rng)),
            source: SelectionSource::Uniform,
        },
        (HouseStrategy::OperatorOverride, Some(number)) if number <= 9 => Selection {
            result: DrawResult::from_digit(number),
            source: SelectionSource::Operator,
        },
        _ => Selection {
            result: DrawResult::from_digit(adversarial_number(snapshot, rng)),
            source: SelectionSource::Adversarial,
        },
    }
}

pub fn uniform_number<R: Rng + ?Sized>(rng: &mut R) -> u8 {
    rng.gen_range(0..10)
}

/// Every bucket whose stake equals the minimum across all buckets
pub fn lowest_stake_buckets(snapshot: &StakeSnapshot) -> Vec<Bucket> {
    let min = snapshot
        .entries()
        .map(|(_, total)| total.amount)
        .min()
        .unwrap_or(0);
    snapshot
        .entries()
        .filter(|(_, total)| total.amount == min)
        .map(|(bucket, _)| bucket)
        .collect()
}

pub fn adversarial_number<R: Rng + ?Sized>(snapshot: &StakeSnapshot, rng: &mut R) -> u8 {
    if snapshot.is_empty() {
        return uniform_number(rng);
    }
    let candidates = lowest_stake_buckets(snapshot);
    candidates
        .choose(rng)
        .and_then(|bucket| bucket.numbers().choose(rng).copied())
        .unwrap_or_else(|| uniform_number(rng))
}
