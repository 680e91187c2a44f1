//! Broadcast hub
//!
//! One `tokio::sync::broadcast` channel per mode plus one per connected bettor.
//! Publishing never waits: a lagging receiver skips events and resyncs from
//! [`BroadcastHub::current_state`].

use crate::games::types::{
    Amount, BettorId, DrawResult, ModeId, ModeKind, Multiplier, PeriodId, RecentResult,
    RoundStatus, WagerId, WagerStatus,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Events pushed to viewers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GameEvent {
    /// A new discrete round accepts wagers
    RoundOpened {
        mode: ModeId,
        period: PeriodId,
        duration_secs: u64,
        closes_at: DateTime<Utc>,
    },

    Countdown {
        mode: ModeId,
        period: PeriodId,
        remaining_secs: u64,
        locked: bool,
    },

    BettingLocked {
        mode: ModeId,
        period: PeriodId,
        remaining_secs: u64,
    },

    ResultDrawn {
        mode: ModeId,
        period: PeriodId,
        result: DrawResult,
    },

    RoundSettled {
        mode: ModeId,
        period: PeriodId,
        status: RoundStatus,
        wagers: u32,
        total_payout: Amount,
    },

    CrashWaiting {
        mode: ModeId,
        period: PeriodId,
        starts_in_ms: u64,
    },

    CrashStarted {
        mode: ModeId,
        period: PeriodId,
    },

    MultiplierTick {
        mode: ModeId,
        period: PeriodId,
        multiplier: Multiplier,
    },

    CashedOut {
        mode: ModeId,
        period: PeriodId,
        wager_id: WagerId,
        bettor: BettorId,
        multiplier: Multiplier,
        payout: Amount,
    },

    Crashed {
        mode: ModeId,
        period: PeriodId,
        crash_point: Multiplier,
    },

    /// Per-bettor notification, only sent on the bettor's personal feed
    WagerSettled {
        mode: ModeId,
        period: PeriodId,
        wager_id: WagerId,
        status: WagerStatus,
        payout: Amount,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outcome: Option<DrawResult>,
    },

    Heartbeat { timestamp: i64 },
}

impl GameEvent {
    pub fn mode(&self) -> Option<&ModeId> {
        match self {
            GameEvent::RoundOpened { mode, .. }
            | GameEvent::Countdown { mode, .. }
            | GameEvent::BettingLocked { mode, .. }
            | GameEvent::ResultDrawn { mode, .. }
            | GameEvent::RoundSettled { mode, .. }
            | GameEvent::CrashWaiting { mode, .. }
            | GameEvent::CrashStarted { mode, .. }
            | GameEvent::MultiplierTick { mode, .. }
            | GameEvent::CashedOut { mode, .. }
            | GameEvent::Crashed { mode, .. }
            | GameEvent::WagerSettled { mode, .. } => Some(mode),
            GameEvent::Heartbeat { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundPhase {
    Open,
    Locked,
    Waiting,
    Running,
    Crashed,
}

/// Live part of a mode's state, pushed by the engine on every transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveState {
    pub period: PeriodId,
    pub phase: RoundPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<Multiplier>,
}

/// Authoritative point-in-time view of a mode for late joiners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeSnapshot {
    pub mode: ModeId,
    pub kind: ModeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveState>,
    pub recent_results: Vec<RecentResult>,
    pub viewers: usize,
    pub as_of: DateTime<Utc>,
}

struct ModeState {
    kind: ModeKind,
    live: Option<LiveState>,
    history: VecDeque<RecentResult>,
}

/// Fan-out point between the engine and connected viewers
#[derive(Clone)]
pub struct BroadcastHub {
    channels: Arc<DashMap<ModeId, broadcast::Sender<GameEvent>>>,
    states: Arc<DashMap<ModeId, ModeState>>,
    viewers: Arc<DashMap<ModeId, Arc<AtomicUsize>>>,
    personal: Arc<DashMap<BettorId, broadcast::Sender<GameEvent>>>,
    capacity: usize,
    history_len: usize,
}

impl BroadcastHub {
    pub fn new(capacity: usize, history_len: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            states: Arc::new(DashMap::new()),
            viewers: Arc::new(DashMap::new()),
            personal: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            history_len,
        }
    }

    pub fn register_mode(&self, mode: &ModeId, kind: ModeKind) {
        self.channels
            .entry(mode.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        self.viewers
            .entry(mode.clone())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
        self.states.entry(mode.clone()).or_insert_with(|| ModeState {
            kind,
            live: None,
            history: VecDeque::with_capacity(self.history_len),
        });
    }

    pub fn subscribe(&self, mode: &ModeId) -> Option<Subscription> {
        let events = self.channels.get(mode)?.subscribe();
        let viewers = self.viewers.get(mode)?.clone();
        let count = viewers.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(mode = %mode, viewers = count, "Viewer subscribed");
        Some(Subscription {
            mode: mode.clone(),
            events,
            viewers,
        })
    }

    /// Personal feed carrying `WagerSettled` notifications for one bettor
    pub fn subscribe_bettor(&self, bettor: &BettorId) -> PersonalFeed {
        let events = self
            .personal
            .entry(bettor.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        PersonalFeed {
            bettor: bettor.clone(),
            events,
            registry: self.personal.clone(),
        }
    }

    /// Send to every viewer of the event's mode
    pub fn publish(&self, event: GameEvent) {
        let Some(mode) = event.mode() else {
            self.publish_all(event);
            return;
        };
        if let Some(tx) = self.channels.get(mode) {
            // Err only means nobody is watching
            let _ = tx.send(event);
        }
    }

    pub fn publish_all(&self, event: GameEvent) {
        for tx in self.channels.iter() {
            let _ = tx.send(event.clone());
        }
    }

    /// Send to one bettor's personal feed, if they are connected
    pub fn notify(&self, bettor: &BettorId, event: GameEvent) {
        if let Some(tx) = self.personal.get(bettor) {
            let _ = tx.send(event);
        }
    }

    pub fn set_live(&self, mode: &ModeId, live: LiveState) {
        if let Some(mut state) = self.states.get_mut(mode) {
            state.live = Some(live);
        }
    }

    /// Push a drawn result onto the front of the mode's history
    pub fn record_result(&self, mode: &ModeId, result: RecentResult) {
        if let Some(mut state) = self.states.get_mut(mode) {
            state.history.retain(|r| r.period != result.period);
            state.history.push_front(result);
            let len = self.history_len;
            state.history.truncate(len);
        }
    }

    /// Replace the history, newest first, e.g. from persisted rounds on startup
    pub fn seed_history(&self, mode: &ModeId, results: Vec<RecentResult>) {
        if let Some(mut state) = self.states.get_mut(mode) {
            state.history = results.into_iter().take(self.history_len).collect();
        }
    }

    pub fn current_state(&self, mode: &ModeId) -> Option<ModeSnapshot> {
        let state = self.states.get(mode)?;
        Some(ModeSnapshot {
            mode: mode.clone(),
            kind: state.kind,
            live: state.live.clone(),
            recent_results: state.history.iter().copied().collect(),
            viewers: self.viewer_count(mode),
            as_of: Utc::now(),
        })
    }

    pub fn viewer_count(&self, mode: &ModeId) -> usize {
        self.viewers
            .get(mode)
            .map(|v| v.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn modes(&self) -> Vec<ModeId> {
        let mut modes: Vec<ModeId> = self.states.iter().map(|e| e.key().clone()).collect();
        modes.sort();
        modes
    }
}

/// A viewer's interest in one mode; unsubscribes on drop
pub struct Subscription {
    mode: ModeId,
    events: broadcast::Receiver<GameEvent>,
    viewers: Arc<AtomicUsize>,
}

impl Subscription {
    pub fn mode(&self) -> &ModeId {
        &self.mode
    }

    pub async fn recv(&mut self) -> Result<GameEvent, broadcast::error::RecvError> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let remaining = self.viewers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        debug!(mode = %self.mode, viewers = remaining, "Viewer unsubscribed");
    }
}

/// A bettor's personal notification feed; unregisters when the last one drops
pub struct PersonalFeed {
    bettor: BettorId,
    events: broadcast::Receiver<GameEvent>,
    registry: Arc<DashMap<BettorId, broadcast::Sender<GameEvent>>>,
}

impl PersonalFeed {
    pub async fn recv(&mut self) -> Result<GameEvent, broadcast::error::RecvError> {
        self.events.recv().await
    }
}

impl Drop for PersonalFeed {
    fn drop(&mut self) {
        // Our own receiver is still alive here
        self.registry
            .remove_if(&self.bettor, |_, tx| tx.receiver_count() <= 1);
    }
}
