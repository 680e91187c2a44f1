//! Round and wager records survive a restart on the RocksDB backend

use roundhouse::config::StorageBackend;
use roundhouse::games::types::{BettorId, ModeId, RoundStatus, WagerId, WagerStatus};
use roundhouse::{AccountService, EngineBuilder, EngineConfig, InMemoryAccounts, WagerRequest};
use std::sync::Arc;

fn bet(bettor: &str, bucket: &str, amount: u64, id: &str) -> WagerRequest {
    WagerRequest {
        bettor: BettorId::new(bettor),
        mode: ModeId::new("30"),
        period: None,
        bucket: Some(bucket.to_string()),
        amount,
        wager_id: Some(WagerId::new(id)),
    }
}

#[tokio::test]
async fn test_restart_resumes_periods_and_voids_undrawn_round() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::testing();
    config.storage.backend = StorageBackend::RocksDb;
    config.storage.data_dir = dir.path().join("rounds");

    // Accounts live outside the engine, like the real wallet service
    let accounts = Arc::new(InMemoryAccounts::new(1_000));
    let thirty = ModeId::new("30");

    // === Phase 1: settle one round, leave a wager on the next one ===
    let (settled_period, open_period) = {
        let engine = EngineBuilder::new(config.clone())
            .with_accounts(accounts.clone())
            .build()
            .await
            .unwrap();

        let wager = engine.place_wager(bet("alice", "3", 100, "w-alice")).await.unwrap();
        let forced = engine.force_draw(&thirty, wager.period, 3).await.unwrap();
        assert_eq!(forced.settlement.await.unwrap(), RoundStatus::Settled);

        let stranded = engine.place_wager(bet("bob", "Big", 50, "w-bob")).await.unwrap();
        assert_eq!(stranded.period, forced.next_period);
        (forced.period, forced.next_period)
    };
    assert_eq!(accounts.balance(&BettorId::new("bob")).await.unwrap(), 950);

    // === Phase 2: reopen the same directory ===
    let engine = EngineBuilder::new(config)
        .with_accounts(accounts.clone())
        .build()
        .await
        .unwrap();

    let current = engine.state(&thirty).unwrap().live.unwrap().period;
    assert!(current > open_period);

    let history = engine.state(&thirty).unwrap().recent_results;
    assert!(history.iter().any(|r| r.period == settled_period));

    let report = engine.recover().await;
    assert_eq!(report.resettled, 0);
    assert_eq!(report.refunded, 1);
    assert!(report.voided >= 1);

    let bob = engine.store().find_wager(&WagerId::new("w-bob")).await.unwrap().unwrap();
    assert_eq!(bob.status, WagerStatus::Refunded);
    assert_eq!(accounts.balance(&BettorId::new("bob")).await.unwrap(), 1_000);

    let alice = engine.wagers_for(&BettorId::new("alice"), 10).await.unwrap();
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].status, WagerStatus::Won);
    assert_eq!(alice[0].payout, 900);

    // Resubmitting a settled wager id returns the stored wager without a new debit
    let replay = engine.place_wager(bet("alice", "3", 100, "w-alice")).await.unwrap();
    assert_eq!(replay.period, settled_period);
    assert_eq!(accounts.balance(&BettorId::new("alice")).await.unwrap(), 1_800);

    // A second recovery finds nothing left to do
    let again = engine.recover().await;
    assert_eq!(again.resettled, 0);
    assert_eq!(again.refunded, 0);
    assert_eq!(again.voided, 0);

    let rounds = engine.recent_results(&thirty, 10).await.unwrap();
    assert_eq!(rounds[0].period, settled_period);
    assert_eq!(rounds[0].status, RoundStatus::Settled);
}
