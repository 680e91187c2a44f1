//! Roundhouse - real-time round-based betting engine
//!
//! Discrete 0-9 color/size rounds on fixed timers and a crash-style
//! multiplier game. Each mode owns its round state; settlement runs off the
//! timer path and is idempotent per wager; events fan out per mode over
//! broadcast channels.

pub mod accounts;
pub mod api;
pub mod broadcast;
pub mod config;
pub mod engine;
pub mod errors;
pub mod games;
pub mod identity;
pub mod metrics;
pub mod scheduler;
pub mod store;

pub use accounts::{AccountService, InMemoryAccounts};
pub use broadcast::{BroadcastHub, GameEvent, ModeSnapshot};
pub use config::{ConfigLoader, EngineConfig, ModeConfig, ModePatch};
pub use engine::{EngineBuilder, GameEngine, TickReport, WagerRequest};
pub use errors::{RoundhouseError, RoundhouseResult};
pub use scheduler::Scheduler;
pub use store::{MemoryStore, RecordStore, RocksStore};
