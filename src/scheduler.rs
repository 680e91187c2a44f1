//! Background clock
//!
//! One task per mode, plus the credit retry loop and the viewer heartbeat.
//! A mode's task only ever touches its own table, so a slow draw in one mode
//! never delays another.

use crate::engine::GameEngine;
use crate::games::types::{ModeId, ModeKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct Scheduler {
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn every background loop for `engine`
    pub fn start(engine: Arc<GameEngine>) -> Self {
        let mut tasks = Vec::new();

        for mode in engine.mode_ids().to_vec() {
            let cadence = match engine.mode_kind(&mode) {
                Some(ModeKind::Crash) => engine.config().crash.tick_interval(),
                _ => Duration::from_secs(1),
            };
            info!(mode = %mode, cadence_ms = cadence.as_millis() as u64, "Starting mode clock");
            tasks.push(tokio::spawn(run_mode(Arc::clone(&engine), mode, cadence)));
        }

        tasks.push(tokio::spawn(run_retries(Arc::clone(&engine))));
        tasks.push(tokio::spawn(run_heartbeat(engine)));

        Self { tasks }
    }

    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        info!(tasks = self.tasks.len(), "Scheduler stopped");
    }
}

async fn run_mode(engine: Arc<GameEngine>, mode: ModeId, cadence: Duration) {
    let mut ticker = interval(cadence);
    // The first tick completes immediately; the round has only just opened
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if engine.tick(&mode).await.is_none() {
            warn!(mode = %mode, "Mode disappeared, stopping its clock");
            return;
        }
    }
}

async fn run_retries(engine: Arc<GameEngine>) {
    let mut ticker = interval(engine.config().settlement.retry_poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let summary = engine.process_retries().await;
        if summary.attempted > 0 {
            debug!(
                attempted = summary.attempted,
                credited = summary.credited,
                exhausted = summary.exhausted,
                "Processed credit retries"
            );
        }
    }
}

async fn run_heartbeat(engine: Arc<GameEngine>) {
    let period = Duration::from_secs(engine.config().broadcast.heartbeat_secs.max(1));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        engine.heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::EngineBuilder;

    #[tokio::test]
    async fn test_clock_advances_discrete_mode() {
        let engine = EngineBuilder::new(EngineConfig::testing()).build().await.unwrap();
        let mode = ModeId::new("30");
        let before = engine.state(&mode).unwrap().live.unwrap();

        let scheduler = Scheduler::start(Arc::clone(&engine));
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let after = engine.state(&mode).unwrap().live.unwrap();
        assert_eq!(after.period, before.period);
        let remaining = after.remaining_secs.unwrap();
        assert!((27..=28).contains(&remaining), "remaining {}", remaining);
        assert!(engine.metrics().render().unwrap().contains("roundhouse_mode_last_tick_unix_seconds"));
        scheduler.shutdown();
    }
}
