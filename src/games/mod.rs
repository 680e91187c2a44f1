pub mod aggregator;
pub mod crash;
pub mod period;
pub mod round;
pub mod selector;
pub mod settlement;
pub mod types;

pub use aggregator::{StakeBook, StakeSnapshot};
pub use crash::{CrashStep, CrashTable};
pub use round::{ClosedRound, ModeTable, TickOutcome};
pub use settlement::{PayoutTable, SettlementEngine};
pub use types::*;
