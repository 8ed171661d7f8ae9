//! Integration tests for the delete-bitmap update lock protocol.
//!
//! Every request goes through [`MetaServiceProxy`], so store conflicts between
//! racing acquirers are retried exactly as in production.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use nimbus_core::keys::{DeleteBitmapLockKey, StorageKey};
use nimbus_core::prelude::*;
use nimbus_meta::lock::LockRecord;
use nimbus_meta::prelude::*;
use nimbus_test_utils::{ScriptedTxnKv, SimulatedClock, TestTable, bitmap_key, init_test_logging, rows};

struct Harness {
    kv: ScriptedTxnKv,
    clock: Arc<SimulatedClock>,
    proxy: MetaServiceProxy,
    table: TestTable,
}

impl Harness {
    fn new(instance: &str, v2_allow_list: &str) -> Self {
        Self::with_store(instance, v2_allow_list, ScriptedTxnKv::new())
    }

    fn with_store(instance: &str, v2_allow_list: &str, kv: ScriptedTxnKv) -> Self {
        init_test_logging();
        let clock = Arc::new(SimulatedClock::deterministic());
        let config = MetaServiceConfig {
            lock: LockConfig {
                v2_allow_list: v2_allow_list.to_string(),
                default_expiration_secs: 10,
            },
            retry: RetryConfig {
                base_interval_ms: 1,
                ..RetryConfig::default()
            },
            ..MetaServiceConfig::default()
        };
        let service = MetaServiceImpl::new(
            Arc::new(kv.clone()),
            clock.clone(),
            config,
            Arc::new(MetaServiceMetrics::new()),
        )
        .expect("valid config");
        let service = Arc::new(service);
        Self {
            kv,
            clock,
            proxy: MetaServiceProxy::new(service),
            table: TestTable::new(instance, 3),
        }
    }

    fn lock_req(&self, lock_id: i64, initiator: i64) -> GetDeleteBitmapUpdateLockRequest {
        GetDeleteBitmapUpdateLockRequest {
            instance_id: self.table.instance.to_string(),
            table_id: self.table.table.get(),
            tablet_ids: vec![self.table.tablet().get()],
            lock_id,
            initiator,
            ..Default::default()
        }
    }

    fn unlock_req(&self, lock_id: i64, initiator: i64) -> RemoveDeleteBitmapUpdateLockRequest {
        RemoveDeleteBitmapUpdateLockRequest {
            instance_id: self.table.instance.to_string(),
            table_id: self.table.table.get(),
            tablet_ids: vec![self.table.tablet().get()],
            lock_id,
            initiator,
            ..Default::default()
        }
    }

    fn update_req(&self, lock_id: i64, initiator: i64) -> UpdateDeleteBitmapRequest {
        UpdateDeleteBitmapRequest {
            instance_id: self.table.instance.to_string(),
            table_id: self.table.table.get(),
            tablet_id: self.table.tablet().get(),
            lock_id,
            initiator,
            bitmap: [(bitmap_key("rs_new", 0, 7), rows(&[1, 5, 9]))]
                .into_iter()
                .collect(),
        }
    }

    async fn acquire(&self, lock_id: i64, initiator: i64) -> MetaServiceCode {
        self.proxy
            .get_delete_bitmap_update_lock(&self.lock_req(lock_id, initiator))
            .await
            .status
            .code
    }

    async fn release(&self, lock_id: i64, initiator: i64) -> MetaServiceCode {
        self.proxy
            .remove_delete_bitmap_update_lock(&self.unlock_req(lock_id, initiator))
            .await
            .status
            .code
    }

    fn record(&self, key: &DeleteBitmapLockKey) -> Option<LockRecord> {
        self.kv
            .inner()
            .live_entries()
            .expect("entries")
            .into_iter()
            .find(|(k, _)| k.as_slice() == key.as_bytes())
            .map(|(_, v)| LockRecord::decode(&v).expect("lock record"))
    }

    fn tablet_key(&self, tablet: TabletId) -> DeleteBitmapLockKey {
        DeleteBitmapLockKey::tablet(&self.table.instance, self.table.table, tablet)
    }

    fn table_key(&self) -> DeleteBitmapLockKey {
        DeleteBitmapLockKey::table(&self.table.instance, self.table.table)
    }

    fn metrics(&self) -> MetaMetricsSnapshot {
        self.proxy.service().metrics().snapshot()
    }
}

#[tokio::test]
async fn loads_share_the_lock_and_compaction_waits_for_them() {
    let h = Harness::new("warehouse2", "warehouse2");
    let key = h.tablet_key(h.table.tablet());

    assert_eq!(h.acquire(101, 1).await, MetaServiceCode::Ok);
    let record = h.record(&key).expect("record");
    assert_eq!(record.lock_id, 101);
    assert_eq!(record.initiators.iter().copied().collect::<Vec<_>>(), vec![1]);

    assert_eq!(h.acquire(102, 2).await, MetaServiceCode::Ok);
    let record = h.record(&key).expect("record");
    assert_eq!(record.lock_id, 101);
    assert_eq!(record.initiators.iter().copied().collect::<Vec<_>>(), vec![1, 2]);

    assert_eq!(h.acquire(COMPACTION_LOCK_ID, 7).await, MetaServiceCode::LockConflict);

    assert_eq!(h.release(101, 1).await, MetaServiceCode::Ok);
    assert_eq!(
        h.record(&key).expect("record").initiators.iter().copied().collect::<Vec<_>>(),
        vec![2]
    );
    assert_eq!(h.release(102, 2).await, MetaServiceCode::Ok);
    assert!(h.record(&key).is_none());

    assert_eq!(h.acquire(COMPACTION_LOCK_ID, 7).await, MetaServiceCode::Ok);
    assert_eq!(h.record(&key).expect("record").lock_id, COMPACTION_LOCK_ID);

    let m = h.metrics();
    assert_eq!(m.locks_acquired, 2);
    assert_eq!(m.locks_joined, 1);
    assert_eq!(m.locks_busy, 1);
    assert_eq!(m.locks_released, 2);
}

#[tokio::test]
async fn allow_list_routes_instances_to_table_or_tablet_scope() {
    let v1 = Harness::new("warehouse1", "warehouse2");
    assert_eq!(
        v1.proxy.get_delete_bitmap_lock_version(&v1.table.instance),
        LockVersion::V1
    );
    assert_eq!(v1.acquire(SCHEMA_CHANGE_LOCK_ID, 3).await, MetaServiceCode::Ok);
    assert!(v1.record(&v1.table_key()).is_some());
    assert!(v1.record(&v1.tablet_key(v1.table.tablet())).is_none());

    let v2 = Harness::new("warehouse2", "warehouse2");
    assert_eq!(v2.acquire(SCHEMA_CHANGE_LOCK_ID, 3).await, MetaServiceCode::Ok);
    assert!(v2.record(&v2.table_key()).is_none());
    assert!(v2.record(&v2.tablet_key(v2.table.tablet())).is_some());
}

#[tokio::test]
async fn allow_list_updates_apply_to_later_requests() {
    let h = Harness::new("warehouse1", "");
    assert_eq!(
        h.proxy.get_delete_bitmap_lock_version(&h.table.instance),
        LockVersion::V1
    );
    h.proxy
        .service()
        .update_lock_v2_allow_list("warehouse1;warehouse9");
    assert_eq!(
        h.proxy.get_delete_bitmap_lock_version(&h.table.instance),
        LockVersion::V2
    );
}

#[tokio::test]
async fn expired_lock_is_taken_over_and_stale_release_is_ignored() {
    let h = Harness::new("warehouse1", "");
    let mut req = h.lock_req(COMPACTION_LOCK_ID, 7);
    req.expiration_secs = Some(5);
    let resp = h.proxy.get_delete_bitmap_update_lock(&req).await;
    assert!(resp.status.is_ok());

    assert_eq!(h.acquire(201, 201).await, MetaServiceCode::LockConflict);
    h.clock.advance(Duration::from_secs(6));
    assert_eq!(h.acquire(201, 201).await, MetaServiceCode::Ok);

    let update = h
        .proxy
        .update_delete_bitmap(&h.update_req(COMPACTION_LOCK_ID, 7))
        .await;
    assert_eq!(update.status.code, MetaServiceCode::LockExpired);

    assert_eq!(h.release(COMPACTION_LOCK_ID, 7).await, MetaServiceCode::Ok);
    let record = h.record(&h.table_key()).expect("load still holds the lock");
    assert_eq!(record.lock_id, 201);

    let m = h.metrics();
    assert_eq!(m.locks_taken_over, 1);
    assert_eq!(m.stale_releases, 1);
}

#[tokio::test]
async fn holder_can_refresh_its_lease() {
    let h = Harness::new("warehouse1", "");
    assert_eq!(h.acquire(COMPACTION_LOCK_ID, 7).await, MetaServiceCode::Ok);
    let first = h.record(&h.table_key()).expect("record").expiration;

    h.clock.advance(Duration::from_secs(8));
    assert_eq!(h.acquire(COMPACTION_LOCK_ID, 7).await, MetaServiceCode::Ok);
    let refreshed = h.record(&h.table_key()).expect("record").expiration;
    assert!(refreshed > first);

    assert_eq!(h.acquire(COMPACTION_LOCK_ID, 8).await, MetaServiceCode::LockConflict);
}

#[tokio::test]
async fn malformed_and_mismatched_requests_are_rejected_without_store_access() {
    let h = Harness::new("warehouse2", "warehouse2");

    let mut mismatched = h.lock_req(101, 1);
    mismatched.lock_version = Some(LockVersion::V1);
    let resp = h.proxy.get_delete_bitmap_update_lock(&mismatched).await;
    assert_eq!(resp.status.code, MetaServiceCode::ProtocolVersionMismatch);
    assert!(resp.status.msg.contains("v2"));

    let mut no_tablets = h.lock_req(101, 1);
    no_tablets.tablet_ids.clear();
    let resp = h.proxy.get_delete_bitmap_update_lock(&no_tablets).await;
    assert_eq!(resp.status.code, MetaServiceCode::InvalidArgument);

    for lock_id in [0, -4, LOCK_FREE_COMPACTION_LOCK_ID] {
        assert_eq!(h.acquire(lock_id, 1).await, MetaServiceCode::InvalidArgument);
    }

    let mut bad_instance = h.lock_req(101, 1);
    bad_instance.instance_id = "has space".to_string();
    let resp = h.proxy.get_delete_bitmap_update_lock(&bad_instance).await;
    assert_eq!(resp.status.code, MetaServiceCode::InvalidArgument);

    assert_eq!(h.kv.commit_attempts(), 0);
}

#[tokio::test]
async fn v2_acquisition_is_all_or_nothing_across_tablets() {
    let h = Harness::new("warehouse2", "warehouse2");
    let [a, b, c] = [h.table.tablets[0], h.table.tablets[1], h.table.tablets[2]];

    let mut compaction = h.lock_req(COMPACTION_LOCK_ID, 7);
    compaction.tablet_ids = vec![b.get()];
    assert!(h.proxy.get_delete_bitmap_update_lock(&compaction).await.status.is_ok());

    let mut load = h.lock_req(301, 301);
    load.tablet_ids = vec![a.get(), b.get(), c.get()];
    let resp = h.proxy.get_delete_bitmap_update_lock(&load).await;
    assert_eq!(resp.status.code, MetaServiceCode::LockConflict);
    assert!(h.record(&h.tablet_key(a)).is_none());
    assert!(h.record(&h.tablet_key(c)).is_none());

    load.tablet_ids = vec![a.get(), c.get()];
    assert!(h.proxy.get_delete_bitmap_update_lock(&load).await.status.is_ok());
    assert_eq!(h.record(&h.tablet_key(a)).expect("a").lock_id, 301);
    assert_eq!(h.record(&h.tablet_key(c)).expect("c").lock_id, 301);
}

#[tokio::test]
async fn bitmap_updates_require_the_lock() {
    let h = Harness::new("warehouse1", "");
    assert_eq!(h.acquire(401, 401).await, MetaServiceCode::Ok);

    let wrong_initiator = h.proxy.update_delete_bitmap(&h.update_req(401, 999)).await;
    assert_eq!(wrong_initiator.status.code, MetaServiceCode::LockExpired);

    let ok = h.proxy.update_delete_bitmap(&h.update_req(401, 401)).await;
    assert!(ok.status.is_ok(), "{:?}", ok.status);

    let lock_free = h
        .proxy
        .update_delete_bitmap(&h.update_req(LOCK_FREE_COMPACTION_LOCK_ID, 0))
        .await;
    assert!(lock_free.status.is_ok());

    let read = h
        .proxy
        .get_delete_bitmap(&GetDeleteBitmapRequest {
            instance_id: h.table.instance.to_string(),
            tablet_id: h.table.tablet().get(),
            rowset_ids: vec!["rs_new".to_string()],
            begin_version: 0,
            end_version: 10,
        })
        .await;
    assert!(read.status.is_ok());
    assert_eq!(read.bitmap.get(&bitmap_key("rs_new", 0, 7)), Some(&rows(&[1, 5, 9])));
}

#[tokio::test]
async fn delete_bitmaps_round_trip_with_version_filter_and_stats() {
    let h = Harness::new("warehouse1", "");
    assert_eq!(h.acquire(COMPACTION_LOCK_ID, 7).await, MetaServiceCode::Ok);

    let mut update = h.update_req(COMPACTION_LOCK_ID, 7);
    update.bitmap = [
        (bitmap_key("rs_a", 0, 3), rows(&[1, 2])),
        (bitmap_key("rs_a", 1, 5), rows(&[4])),
        (bitmap_key("rs_b", 0, 9), rows(&[8, 9, 10])),
    ]
    .into_iter()
    .collect();
    assert!(h.proxy.update_delete_bitmap(&update).await.status.is_ok());

    let read = h
        .proxy
        .get_delete_bitmap(&GetDeleteBitmapRequest {
            instance_id: h.table.instance.to_string(),
            tablet_id: h.table.tablet().get(),
            rowset_ids: vec!["rs_a".to_string(), "rs_b".to_string()],
            begin_version: 4,
            end_version: 9,
        })
        .await;
    assert_eq!(read.bitmap.len(), 2);
    assert!(read.bitmap.get(&bitmap_key("rs_a", 0, 3)).is_none());

    let mut stats_req = h.lock_req(COMPACTION_LOCK_ID, 7);
    stats_req.require_tablet_stats = true;
    let stats = h.proxy.get_delete_bitmap_update_lock(&stats_req).await.tablet_stats;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].delete_bitmap_entries, 3);
    assert_eq!(stats[0].deleted_rows, 6);

    let removed = h
        .proxy
        .remove_delete_bitmap(&RemoveDeleteBitmapRequest {
            instance_id: h.table.instance.to_string(),
            table_id: h.table.table.get(),
            tablet_id: h.table.tablet().get(),
            rowset_ids: vec!["rs_a".to_string()],
        })
        .await;
    assert!(removed.status.is_ok());

    let stats = h.proxy.get_delete_bitmap_update_lock(&stats_req).await.tablet_stats;
    assert_eq!(stats[0].delete_bitmap_entries, 1);
    assert_eq!(stats[0].deleted_rows, 3);

    let mut inverted = GetDeleteBitmapRequest {
        instance_id: h.table.instance.to_string(),
        tablet_id: h.table.tablet().get(),
        rowset_ids: vec!["rs_b".to_string()],
        begin_version: 9,
        end_version: 1,
    };
    assert_eq!(
        h.proxy.get_delete_bitmap(&inverted).await.status.code,
        MetaServiceCode::InvalidArgument
    );
    inverted.begin_version = 0;
    inverted.end_version = 100;
    assert_eq!(h.proxy.get_delete_bitmap(&inverted).await.bitmap.cardinality(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_compactions_elect_exactly_one_holder() {
    let h = Arc::new(Harness::with_store(
        "warehouse1",
        "",
        ScriptedTxnKv::new().with_latency(Duration::from_millis(1)),
    ));

    let codes = join_all((1..=8).map(|initiator| {
        let h = h.clone();
        tokio::spawn(async move { h.acquire(COMPACTION_LOCK_ID, initiator).await })
    }))
    .await;
    let codes: Vec<_> = codes.into_iter().map(|c| c.expect("task")).collect();

    let winners = codes.iter().filter(|c| **c == MetaServiceCode::Ok).count();
    assert_eq!(winners, 1, "{codes:?}");
    assert!(codes
        .iter()
        .all(|c| matches!(c, MetaServiceCode::Ok | MetaServiceCode::LockConflict)));
    assert_eq!(
        h.record(&h.table_key()).expect("record").initiators.len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_loads_all_join() {
    let h = Arc::new(Harness::new("warehouse1", ""));

    let codes = join_all((1..=8).map(|txn| {
        let h = h.clone();
        tokio::spawn(async move { h.acquire(500 + txn, 500 + txn).await })
    }))
    .await;
    assert!(codes.into_iter().all(|c| c.expect("task") == MetaServiceCode::Ok));

    let record = h.record(&h.table_key()).expect("record");
    assert_eq!(record.initiators.len(), 8);

    for txn in 1..=8 {
        assert_eq!(h.release(500 + txn, 500 + txn).await, MetaServiceCode::Ok);
    }
    assert!(h.record(&h.table_key()).is_none());
}

#[test]
fn handlers_refuse_an_invalid_config() {
    let config = MetaServiceConfig {
        replay: ReplayConfig {
            enabled: true,
            probability: f64::NAN,
            ..ReplayConfig::default()
        },
        ..MetaServiceConfig::default()
    };
    let err = MetaServiceImpl::new(
        Arc::new(ScriptedTxnKv::new()),
        Arc::new(SimulatedClock::deterministic()),
        config,
        Arc::new(MetaServiceMetrics::new()),
    )
    .expect_err("NaN probability");
    assert_eq!(err.code(), MetaServiceCode::InvalidArgument);
}
