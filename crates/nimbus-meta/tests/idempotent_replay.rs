//! Replaying successful requests must leave the stored state unchanged.

use std::sync::Arc;
use std::time::Duration;

use nimbus_meta::prelude::*;
use nimbus_test_utils::{
    ScriptedTxnKv, SeededRandom, SimulatedClock, TestTable, bitmap_key, init_test_logging, rows,
};

struct Fixture {
    kv: ScriptedTxnKv,
    proxy: MetaServiceProxy,
    table: TestTable,
}

fn fixture(exclusion: &[&str]) -> Fixture {
    init_test_logging();
    let kv = ScriptedTxnKv::new();
    let metrics = Arc::new(MetaServiceMetrics::new());
    let config = MetaServiceConfig {
        lock: LockConfig {
            v2_allow_list: "warehouse2".to_string(),
            ..LockConfig::default()
        },
        ..MetaServiceConfig::default()
    };
    let service = MetaServiceImpl::new(
        Arc::new(kv.clone()),
        Arc::new(SimulatedClock::deterministic()),
        config,
        metrics.clone(),
    )
    .expect("valid config");
    let service = Arc::new(service);
    let replay = IdempotentReplayInjector::with_rng(
        ReplayConfig {
            enabled: true,
            probability: 1.0,
            delay_base_ms: 20,
            delay_range_ms: 0,
            exclusion: exclusion.iter().map(ToString::to_string).collect(),
        },
        SeededRandom::with_seed(42).fork(),
        metrics,
    );
    Fixture {
        kv,
        proxy: MetaServiceProxy::new(service).with_replay_injector(replay),
        table: TestTable::new("warehouse2", 1),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn replayed_lock_and_bitmap_requests_do_not_change_state() {
    let f = fixture(&[]);
    let instance_id = f.table.instance.to_string();

    let lock = GetDeleteBitmapUpdateLockRequest {
        instance_id: instance_id.clone(),
        table_id: f.table.table.get(),
        tablet_ids: vec![f.table.tablet().get()],
        lock_id: 101,
        initiator: 1,
        ..Default::default()
    };
    assert!(f.proxy.get_delete_bitmap_update_lock(&lock).await.status.is_ok());
    let after_lock = f.kv.snapshot();
    settle().await;
    assert_eq!(f.kv.snapshot(), after_lock);

    let update = UpdateDeleteBitmapRequest {
        instance_id: instance_id.clone(),
        table_id: f.table.table.get(),
        tablet_id: f.table.tablet().get(),
        lock_id: 101,
        initiator: 1,
        bitmap: [
            (bitmap_key("rs_1", 0, 5), rows(&[3, 4])),
            (bitmap_key("rs_1", 1, 5), rows(&[0])),
        ]
        .into_iter()
        .collect(),
    };
    assert!(f.proxy.update_delete_bitmap(&update).await.status.is_ok());
    let after_update = f.kv.snapshot();
    let commits_before_replay = f.kv.successful_commits();
    settle().await;
    assert_eq!(f.kv.snapshot(), after_update);
    assert!(f.kv.successful_commits() > commits_before_replay, "replay ran");

    let unlock = RemoveDeleteBitmapUpdateLockRequest {
        instance_id,
        table_id: f.table.table.get(),
        tablet_ids: vec![f.table.tablet().get()],
        lock_id: 101,
        initiator: 1,
        ..Default::default()
    };
    assert!(f.proxy.remove_delete_bitmap_update_lock(&unlock).await.status.is_ok());
    let after_unlock = f.kv.snapshot();
    settle().await;
    assert_eq!(f.kv.snapshot(), after_unlock);

    let m = f.proxy.service().metrics().snapshot();
    assert_eq!(m.replays_scheduled, 3);
    assert_eq!(m.stale_releases, 1);
}

#[tokio::test(start_paused = true)]
async fn excluded_requests_are_never_replayed() {
    let f = fixture(&[RemoveDeleteBitmapRequest::NAME]);

    let remove = RemoveDeleteBitmapRequest {
        instance_id: f.table.instance.to_string(),
        table_id: f.table.table.get(),
        tablet_id: f.table.tablet().get(),
        rowset_ids: vec!["rs_1".to_string()],
    };
    assert!(f.proxy.remove_delete_bitmap(&remove).await.status.is_ok());
    let commits = f.kv.commit_attempts();
    settle().await;

    assert_eq!(f.kv.commit_attempts(), commits);
    assert_eq!(f.proxy.service().metrics().snapshot().replays_scheduled, 0);
}
