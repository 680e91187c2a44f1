//! Durable wager and round records
//!
//! Records are JSON values. The RocksDB layout keeps one primary key per record
//! plus small index keys:
//!
//! - `wager:{mode}:{period}:{wager_id}` primary wager record, period zero-padded
//! - `wagerid:{wager_id}` points at the primary key, for duplicate detection
//! - `bettor:{bettor}:{wager_id}` points at the primary key
//! - `round:{mode}:{inverted period}` newest-first round history

use crate::errors::StorageError;
use crate::games::types::{BettorId, ModeId, PeriodId, RoundRecord, RoundStatus, Wager, WagerId};
use async_trait::async_trait;
use dashmap::DashMap;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;

/// Persistence collaborator
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put_wager(&self, wager: &Wager) -> Result<(), StorageError>;

    async fn load_wager(
        &self,
        mode: &ModeId,
        period: PeriodId,
        id: &WagerId,
    ) -> Result<Option<Wager>, StorageError>;

    /// Look a wager up by id alone
    async fn find_wager(&self, id: &WagerId) -> Result<Option<Wager>, StorageError>;

    /// Wagers of a round that have not reached `won` or `lost`
    async fn pending_wagers(&self, mode: &ModeId, period: PeriodId) -> Result<Vec<Wager>, StorageError>;

    /// Most recent wagers of a bettor, newest first
    async fn wagers_for_bettor(&self, bettor: &BettorId, limit: usize) -> Result<Vec<Wager>, StorageError>;

    async fn put_round(&self, round: &RoundRecord) -> Result<(), StorageError>;

    /// Most recent rounds of a mode, newest first
    async fn recent_rounds(&self, mode: &ModeId, limit: usize) -> Result<Vec<RoundRecord>, StorageError>;

    async fn last_period(&self, mode: &ModeId) -> Result<Option<PeriodId>, StorageError> {
        Ok(self.recent_rounds(mode, 1).await?.first().map(|r| r.period))
    }

    /// Rounds left open, drawn or failed, which a restart has to finish
    async fn unsettled_rounds(&self, mode: &ModeId, scan: usize) -> Result<Vec<RoundRecord>, StorageError> {
        Ok(self
            .recent_rounds(mode, scan)
            .await?
            .into_iter()
            .filter(|r| r.status != RoundStatus::Settled)
            .collect())
    }
}

/// In-process store for tests and single-node demos
#[derive(Default)]
pub struct MemoryStore {
    wagers: DashMap<WagerId, Wager>,
    rounds: DashMap<(ModeId, PeriodId), RoundRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn put_wager(&self, wager: &Wager) -> Result<(), StorageError> {
        self.wagers.insert(wager.id.clone(), wager.clone());
        Ok(())
    }

    async fn load_wager(
        &self,
        mode: &ModeId,
        period: PeriodId,
        id: &WagerId,
    ) -> Result<Option<Wager>, StorageError> {
        Ok(self
            .wagers
            .get(id)
            .filter(|w| &w.mode == mode && w.period == period)
            .map(|w| w.clone()))
    }

    async fn find_wager(&self, id: &WagerId) -> Result<Option<Wager>, StorageError> {
        Ok(self.wagers.get(id).map(|w| w.clone()))
    }

    async fn pending_wagers(&self, mode: &ModeId, period: PeriodId) -> Result<Vec<Wager>, StorageError> {
        let mut pending: Vec<Wager> = self
            .wagers
            .iter()
            .filter(|w| &w.mode == mode && w.period == period && !w.status.is_final())
            .map(|w| w.clone())
            .collect();
        pending.sort_by(|a, b| a.placed_at.cmp(&b.placed_at).then_with(|| a.id.cmp(&b.id)));
        Ok(pending)
    }

    async fn wagers_for_bettor(&self, bettor: &BettorId, limit: usize) -> Result<Vec<Wager>, StorageError> {
        let mut wagers: Vec<Wager> = self
            .wagers
            .iter()
            .filter(|w| &w.bettor == bettor)
            .map(|w| w.clone())
            .collect();
        wagers.sort_by(|a, b| b.placed_at.cmp(&a.placed_at));
        wagers.truncate(limit);
        Ok(wagers)
    }

    async fn put_round(&self, round: &RoundRecord) -> Result<(), StorageError> {
        self.rounds
            .insert((round.mode.clone(), round.period), round.clone());
        Ok(())
    }

    async fn recent_rounds(&self, mode: &ModeId, limit: usize) -> Result<Vec<RoundRecord>, StorageError> {
        let mut rounds: Vec<RoundRecord> = self
            .rounds
            .iter()
            .filter(|entry| &entry.key().0 == mode)
            .map(|entry| entry.value().clone())
            .collect();
        rounds.sort_by(|a, b| b.period.cmp(&a.period));
        rounds.truncate(limit);
        Ok(rounds)
    }
}

const WAGER_PREFIX: &str = "wager:";
const WAGER_ID_PREFIX: &str = "wagerid:";
const BETTOR_PREFIX: &str = "bettor:";
const ROUND_PREFIX: &str = "round:";

fn wager_round_prefix(mode: &ModeId, period: PeriodId) -> Vec<u8> {
    format!("{}{}:{:020}:", WAGER_PREFIX, mode, period.value()).into_bytes()
}

fn wager_key(mode: &ModeId, period: PeriodId, id: &WagerId) -> Vec<u8> {
    let mut key = wager_round_prefix(mode, period);
    key.extend_from_slice(id.as_str().as_bytes());
    key
}

fn wager_id_key(id: &WagerId) -> Vec<u8> {
    format!("{}{}", WAGER_ID_PREFIX, id).into_bytes()
}

fn bettor_prefix(bettor: &BettorId) -> Vec<u8> {
    format!("{}{}:", BETTOR_PREFIX, bettor).into_bytes()
}

fn bettor_key(bettor: &BettorId, id: &WagerId) -> Vec<u8> {
    let mut key = bettor_prefix(bettor);
    key.extend_from_slice(id.as_str().as_bytes());
    key
}

fn round_prefix(mode: &ModeId) -> Vec<u8> {
    format!("{}{}:", ROUND_PREFIX, mode).into_bytes()
}

fn round_key(mode: &ModeId, period: PeriodId) -> Vec<u8> {
    // Newest first: inverted period, big-endian
    let inverted = u64::MAX - period.value();
    let mut key = round_prefix(mode);
    key.extend_from_slice(&inverted.to_be_bytes());
    key
}

/// RocksDB-backed store
#[derive(Clone)]
pub struct RocksStore {
    db: Arc<DB>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path).map_err(|e| StorageError::DatabaseOpenFailed(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StorageError> {
        let Some(bytes) = self
            .db
            .get(key)
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Every `(key, value)` under `prefix`, in key order, up to `limit`
    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StorageError> {
        let mut rows = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(prefix) || rows.len() >= limit {
                break;
            }
            rows.push((key, value));
        }
        Ok(rows)
    }
}

#[async_trait]
impl RecordStore for RocksStore {
    async fn put_wager(&self, wager: &Wager) -> Result<(), StorageError> {
        let primary = wager_key(&wager.mode, wager.period, &wager.id);
        let bytes = serde_json::to_vec(wager).map_err(|e| {
            StorageError::WriteFailed(format!("Failed to encode wager {}: {}", wager.id, e))
        })?;

        let mut batch = WriteBatch::default();
        batch.put(&primary, bytes);
        batch.put(wager_id_key(&wager.id), &primary);
        batch.put(bettor_key(&wager.bettor, &wager.id), &primary);
        self.db.write(batch)?;

        tracing::debug!(
            wager_id = %wager.id,
            mode = %wager.mode,
            period = %wager.period,
            status = %wager.status,
            "Stored wager"
        );
        Ok(())
    }

    async fn load_wager(
        &self,
        mode: &ModeId,
        period: PeriodId,
        id: &WagerId,
    ) -> Result<Option<Wager>, StorageError> {
        self.get_json(&wager_key(mode, period, id))
    }

    async fn find_wager(&self, id: &WagerId) -> Result<Option<Wager>, StorageError> {
        let Some(primary) = self
            .db
            .get(wager_id_key(id))
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?
        else {
            return Ok(None);
        };
        self.get_json(&primary)
    }

    async fn pending_wagers(&self, mode: &ModeId, period: PeriodId) -> Result<Vec<Wager>, StorageError> {
        let rows = self.scan_prefix(&wager_round_prefix(mode, period), usize::MAX)?;
        let mut pending = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            let wager: Wager = serde_json::from_slice(&value)?;
            if !wager.status.is_final() {
                pending.push(wager);
            }
        }
        pending.sort_by(|a, b| a.placed_at.cmp(&b.placed_at).then_with(|| a.id.cmp(&b.id)));
        Ok(pending)
    }

    async fn wagers_for_bettor(&self, bettor: &BettorId, limit: usize) -> Result<Vec<Wager>, StorageError> {
        let rows = self.scan_prefix(&bettor_prefix(bettor), usize::MAX)?;
        let mut wagers = Vec::with_capacity(rows.len());
        for (_, primary) in rows {
            if let Some(wager) = self.get_json::<Wager>(&primary)? {
                wagers.push(wager);
            }
        }
        wagers.sort_by(|a, b| b.placed_at.cmp(&a.placed_at));
        wagers.truncate(limit);
        Ok(wagers)
    }

    async fn put_round(&self, round: &RoundRecord) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(round).map_err(|e| {
            StorageError::WriteFailed(format!("Failed to encode round {}: {}", round.period, e))
        })?;
        self.db.put(round_key(&round.mode, round.period), bytes)?;
        Ok(())
    }

    async fn recent_rounds(&self, mode: &ModeId, limit: usize) -> Result<Vec<RoundRecord>, StorageError> {
        let rows = self.scan_prefix(&round_prefix(mode), limit)?;
        rows.iter()
            .map(|(_, value)| serde_json::from_slice(value).map_err(StorageError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::types::{Bucket, WagerKind, WagerStatus};
    use chrono::{Duration, Utc};

    fn wager(id: &str, bettor: &str, period: u64, status: WagerStatus) -> Wager {
        Wager {
            id: WagerId::new(id),
            mode: ModeId::new("30"),
            period: PeriodId::new(period),
            bettor: BettorId::new(bettor),
            kind: WagerKind::Discrete { bucket: Bucket::Red },
            amount: 100,
            status,
            payout: 0,
            outcome: None,
            placed_at: Utc::now(),
            settled_at: None,
        }
    }

    fn round(period: u64, status: RoundStatus) -> RoundRecord {
        RoundRecord {
            mode: ModeId::new("30"),
            period: PeriodId::new(period),
            status,
            result: None,
            crash_point: None,
            source: None,
            opened_at: Utc::now(),
            closed_at: None,
            total_staked: 0,
            wager_count: 0,
        }
    }

    #[test]
    fn test_round_keys_sort_newest_first() {
        let mode = ModeId::new("60");
        let older = round_key(&mode, PeriodId::new(20240101000000));
        let newer = round_key(&mode, PeriodId::new(20240101000001));
        assert!(newer < older);
        assert!(older.starts_with(&round_prefix(&mode)));
    }

    #[test]
    fn test_wager_prefix_does_not_collide_across_modes() {
        let a = wager_round_prefix(&ModeId::new("30"), PeriodId::new(1));
        let b = wager_round_prefix(&ModeId::new("300"), PeriodId::new(1));
        assert!(!b.starts_with(&a));
    }

    #[tokio::test]
    async fn test_memory_store_pending_filter() {
        let store = MemoryStore::new();
        store.put_wager(&wager("a", "alice", 1, WagerStatus::Pending)).await.unwrap();
        store.put_wager(&wager("b", "bob", 1, WagerStatus::Won)).await.unwrap();
        store
            .put_wager(&wager("c", "carol", 1, WagerStatus::AwaitingCredit))
            .await
            .unwrap();
        store.put_wager(&wager("d", "dave", 2, WagerStatus::Pending)).await.unwrap();

        let pending = store.pending_wagers(&ModeId::new("30"), PeriodId::new(1)).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(pending.len(), 2);
        assert!(ids.contains(&"a"));
        assert!(ids.contains(&"c"));
    }

    #[tokio::test]
    async fn test_memory_store_bettor_history_newest_first() {
        let store = MemoryStore::new();
        let mut first = wager("a", "alice", 1, WagerStatus::Lost);
        first.placed_at = Utc::now() - Duration::seconds(60);
        store.put_wager(&first).await.unwrap();
        store.put_wager(&wager("b", "alice", 2, WagerStatus::Pending)).await.unwrap();
        store.put_wager(&wager("c", "bob", 2, WagerStatus::Pending)).await.unwrap();

        let history = store.wagers_for_bettor(&BettorId::new("alice"), 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id.as_str(), "b");
    }

    #[tokio::test]
    async fn test_memory_store_round_queries() {
        let store = MemoryStore::new();
        store.put_round(&round(10, RoundStatus::Settled)).await.unwrap();
        store.put_round(&round(12, RoundStatus::Failed)).await.unwrap();
        store.put_round(&round(11, RoundStatus::Drawn)).await.unwrap();

        let mode = ModeId::new("30");
        assert_eq!(store.last_period(&mode).await.unwrap(), Some(PeriodId::new(12)));

        let unsettled = store.unsettled_rounds(&mode, 10).await.unwrap();
        let periods: Vec<u64> = unsettled.iter().map(|r| r.period.value()).collect();
        assert_eq!(periods, vec![12, 11]);
    }
}
