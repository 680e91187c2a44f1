//! Crash round state machine
//!
//! `waiting -> running -> crashed -> waiting`, advanced one fast tick at a time.
//! The crash point is drawn once when the round starts running and the
//! multiplier freezes there. Cash-outs are decided under the same lock as the
//! ticks, so a cash-out either lands before the crash or not at all.

use crate::broadcast::{LiveState, RoundPhase};
use crate::config::{CrashConfig, ModeConfig, ModePatch};
use crate::errors::{OperatorError, WagerError};
use crate::games::period::PeriodSequence;
use crate::games::round::validate_amount;
use crate::games::types::{Amount, BettorId, Multiplier, PeriodId, WagerId};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPhase {
    Waiting { ticks_left: u64 },
    Running { multiplier: Multiplier, crash_point: Multiplier },
    Crashed { crash_point: Multiplier, cooldown_left: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashEntry {
    pub bettor: BettorId,
    pub amount: Amount,
    pub cashed_out_at: Option<Multiplier>,
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashStep {
    Waiting { period: PeriodId, ticks_left: u64 },
    Started { period: PeriodId },
    Tick { period: PeriodId, multiplier: Multiplier },
    Crashed {
        period: PeriodId,
        opened_at: DateTime<Utc>,
        crash_point: Multiplier,
        total_staked: Amount,
        wager_count: u32,
    },
    Cooldown { period: PeriodId, ticks_left: u64 },
    Opened { period: PeriodId, opened_at: DateTime<Utc>, starts_in_ms: u64 },
}

pub struct CrashTable {
    config: ModeConfig,
    staged: Option<ModeConfig>,
    timings: CrashConfig,
    sequence: PeriodSequence,
    period: PeriodId,
    opened_at: DateTime<Utc>,
    phase: CrashPhase,
    entries: HashMap<WagerId, CrashEntry>,
    rng: StdRng,
}

impl CrashTable {
    pub fn new(
        config: ModeConfig,
        timings: CrashConfig,
        last_period: Option<PeriodId>,
        rng: StdRng,
        now: DateTime<Utc>,
    ) -> Self {
        let mut sequence = PeriodSequence::resume(last_period);
        let period = sequence.next_at(now);
        let phase = CrashPhase::Waiting {
            ticks_left: timings.waiting_ticks(),
        };
        Self {
            config,
            staged: None,
            timings,
            sequence,
            period,
            opened_at: now,
            phase,
            entries: HashMap::new(),
            rng,
        }
    }

    pub fn config(&self) -> &ModeConfig {
        &self.config
    }

    pub fn period(&self) -> PeriodId {
        self.period
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn phase(&self) -> CrashPhase {
        self.phase
    }

    pub fn entry(&self, id: &WagerId) -> Option<&CrashEntry> {
        self.entries.get(id)
    }

    pub fn starts_in_ms(&self) -> u64 {
        match self.phase {
            CrashPhase::Waiting { ticks_left } => ticks_left * self.timings.tick_ms,
            _ => 0,
        }
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> CrashStep {
        match self.phase {
            CrashPhase::Waiting { ticks_left } if ticks_left > 1 => {
                self.phase = CrashPhase::Waiting {
                    ticks_left: ticks_left - 1,
                };
                CrashStep::Waiting {
                    period: self.period,
                    ticks_left: ticks_left - 1,
                }
            }
            CrashPhase::Waiting { .. } => {
                let crash_point = self.draw_crash_point();
                self.phase = CrashPhase::Running {
                    multiplier: Multiplier::ONE,
                    crash_point,
                };
                CrashStep::Started { period: self.period }
            }
            CrashPhase::Running { multiplier, crash_point } => {
                let next = multiplier.saturating_add(self.draw_increment());
                if next >= crash_point {
                    self.phase = CrashPhase::Crashed {
                        crash_point,
                        cooldown_left: self.timings.cooldown_ticks(),
                    };
                    let total_staked = self.entries.values().fold(0u64, |acc, e| acc.saturating_add(e.amount));
                    return CrashStep::Crashed {
                        period: self.period,
                        opened_at: self.opened_at,
                        crash_point,
                        total_staked,
                        wager_count: self.entries.len() as u32,
                    };
                }
                self.phase = CrashPhase::Running {
                    multiplier: next,
                    crash_point,
                };
                CrashStep::Tick {
                    period: self.period,
                    multiplier: next,
                }
            }
            CrashPhase::Crashed { crash_point, cooldown_left } if cooldown_left > 0 => {
                self.phase = CrashPhase::Crashed {
                    crash_point,
                    cooldown_left: cooldown_left - 1,
                };
                CrashStep::Cooldown {
                    period: self.period,
                    ticks_left: cooldown_left - 1,
                }
            }
            CrashPhase::Crashed { .. } => self.open_next(now),
        }
    }

    fn open_next(&mut self, now: DateTime<Utc>) -> CrashStep {
        if let Some(staged) = self.staged.take() {
            self.config = staged;
        }
        self.period = self.sequence.next_at(now);
        self.opened_at = now;
        self.entries.clear();
        self.phase = CrashPhase::Waiting {
            ticks_left: self.timings.waiting_ticks(),
        };
        CrashStep::Opened {
            period: self.period,
            opened_at: now,
            starts_in_ms: self.starts_in_ms(),
        }
    }

    fn draw_crash_point(&mut self) -> Multiplier {
        let (min, max) = (self.timings.min_crash_bp, self.timings.max_crash_bp);
        if min >= max {
            return Multiplier::from_bp(min);
        }
        Multiplier::from_bp(self.rng.gen_range(min..max))
    }

    fn draw_increment(&mut self) -> Multiplier {
        let (min, max) = (self.timings.min_increment_bp, self.timings.max_increment_bp);
        if min >= max {
            return Multiplier::from_bp(min);
        }
        Multiplier::from_bp(self.rng.gen_range(min..max))
    }

    /// Accept a stake into the waiting round
    pub fn join(
        &mut self,
        period: Option<PeriodId>,
        wager_id: &WagerId,
        bettor: &BettorId,
        amount: Amount,
    ) -> Result<PeriodId, WagerError> {
        self.check_open(period)?;
        validate_amount(&self.config, amount)?;
        self.entries.insert(
            wager_id.clone(),
            CrashEntry {
                bettor: bettor.clone(),
                amount,
                cashed_out_at: None,
            },
        );
        Ok(self.period)
    }

    pub fn check_open(&self, period: Option<PeriodId>) -> Result<PeriodId, WagerError> {
        if let Some(requested) = period {
            if requested != self.period {
                return Err(WagerError::PeriodMismatch {
                    requested,
                    current: self.period,
                });
            }
        }
        match self.phase {
            CrashPhase::Waiting { .. } => Ok(self.period),
            _ => Err(WagerError::RoundLocked { period: self.period }),
        }
    }

    pub fn validate_amount(&self, amount: Amount) -> Result<(), WagerError> {
        validate_amount(&self.config, amount)
    }

    /// Drop a stake whose wager could not be persisted
    pub fn remove(&mut self, wager_id: &WagerId) {
        self.entries.remove(wager_id);
    }

    /// Lock in the current multiplier for a running wager
    pub fn cash_out(&mut self, wager_id: &WagerId, bettor: &BettorId) -> Result<(Multiplier, Amount), WagerError> {
        let CrashPhase::Running { multiplier, .. } = self.phase else {
            return Err(WagerError::NotRunning);
        };
        let entry = self
            .entries
            .get_mut(wager_id)
            .filter(|e| &e.bettor == bettor)
            .ok_or_else(|| WagerError::NotFound(wager_id.clone()))?;
        if entry.cashed_out_at.is_some() {
            return Err(WagerError::AlreadyCashedOut(wager_id.clone()));
        }
        entry.cashed_out_at = Some(multiplier);
        Ok((multiplier, multiplier.apply(entry.amount)))
    }

    /// Reverse a cash-out whose record could not be written
    pub fn undo_cash_out(&mut self, wager_id: &WagerId) {
        if let Some(entry) = self.entries.get_mut(wager_id) {
            entry.cashed_out_at = None;
        }
    }

    pub fn stage(&mut self, patch: &ModePatch) -> Result<ModeConfig, OperatorError> {
        let base = self.staged.as_ref().unwrap_or(&self.config);
        let next = patch
            .apply(base)
            .map_err(|e| OperatorError::InvalidSettings(e.to_string()))?;
        self.staged = Some(next.clone());
        Ok(next)
    }

    pub fn live_state(&self) -> LiveState {
        let (phase, multiplier) = match self.phase {
            CrashPhase::Waiting { .. } => (RoundPhase::Waiting, None),
            CrashPhase::Running { multiplier, .. } => (RoundPhase::Running, Some(multiplier)),
            CrashPhase::Crashed { crash_point, .. } => (RoundPhase::Crashed, Some(crash_point)),
        };
        LiveState {
            period: self.period,
            phase,
            remaining_secs: None,
            duration_secs: None,
            multiplier,
        }
    }
}
