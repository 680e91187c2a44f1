//! Period id generation
//!
//! Ids are the UTC wall clock rendered as `YYYYMMDDhhmmss`, bumped past the
//! previous id whenever the clock would repeat or step backwards.

use crate::games::types::PeriodId;
use chrono::{DateTime, Utc};

/// Render a timestamp as a `YYYYMMDDhhmmss` number
pub fn clock_stamp(now: DateTime<Utc>) -> u64 {
    now.format("%Y%m%d%H%M%S")
        .to_string()
        .parse()
        .unwrap_or_default()
}

/// Per-mode period generator
#[derive(Debug, Clone, Default)]
pub struct PeriodSequence {
    last: Option<PeriodId>,
}

impl PeriodSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue after the highest persisted period
    pub fn resume(last: Option<PeriodId>) -> Self {
        Self { last }
    }

    pub fn last(&self) -> Option<PeriodId> {
        self.last
    }

    pub fn next_at(&mut self, now: DateTime<Utc>) -> PeriodId {
        let stamp = PeriodId::new(clock_stamp(now));
        let id = match self.last {
            Some(last) if stamp <= last => last.next(),
            _ => stamp,
        };
        self.last = Some(id);
        id
    }
}
