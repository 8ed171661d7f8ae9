//! Delete-bitmap RPC handlers.
//!
//! Each handler runs exactly one store transaction per invocation: it reads
//! the records it needs, decides the transition, buffers the writes and
//! commits. Handlers never retry on their own; a store error becomes the
//! response status and [`crate::proxy::MetaServiceProxy`] decides whether
//! to re-invoke the handler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use nimbus_core::clock::Clock;
use nimbus_core::delete_bitmap::{BitmapKey, DeleteBitmap, decode_rows, encode_rows};
use nimbus_core::id::{InstanceId, RowsetId, TableId, TabletId, Version};
use nimbus_core::keys::{DeleteBitmapKey, DeleteBitmapLockKey, StorageKey, TabletStatsKey};
use nimbus_core::observability::meta_span;
use nimbus_core::txn_kv::{KvStats, Transaction, TxnKv};
use tracing::{Instrument, debug, info, warn};

use crate::config::MetaServiceConfig;
use crate::error::{MetaError, MetaServiceCode, MetaStatus, Result};
use crate::lock::{
    AcquireDecision, LockKind, LockRecord, LockScope, LockVersion, LockVersionAllowList,
    ReleaseDecision, acquire, holds, release,
};
use crate::metrics::{LockOutcome, MetaServiceMetrics};
use crate::rpc::{
    GetDeleteBitmapRequest, GetDeleteBitmapResponse, GetDeleteBitmapUpdateLockRequest,
    GetDeleteBitmapUpdateLockResponse, MetaRequest, MetaResponse, RemoveDeleteBitmapRequest,
    RemoveDeleteBitmapResponse, RemoveDeleteBitmapUpdateLockRequest,
    RemoveDeleteBitmapUpdateLockResponse, TabletStats, UpdateDeleteBitmapRequest,
    UpdateDeleteBitmapResponse,
};

/// The meta-service handlers, bound to a store and a clock.
pub struct MetaServiceImpl {
    txn_kv: Arc<dyn TxnKv>,
    clock: Arc<dyn Clock>,
    allow_list: LockVersionAllowList,
    config: MetaServiceConfig,
    metrics: Arc<MetaServiceMetrics>,
}

impl std::fmt::Debug for MetaServiceImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaServiceImpl")
            .field("clock", &self.clock)
            .field("allow_list", &self.allow_list)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MetaServiceImpl {
    /// Creates the handlers.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `config` does not pass
    /// [`MetaServiceConfig::validate`].
    pub fn new(
        txn_kv: Arc<dyn TxnKv>,
        clock: Arc<dyn Clock>,
        config: MetaServiceConfig,
        metrics: Arc<MetaServiceMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let allow_list = LockVersionAllowList::parse(&config.lock.v2_allow_list);
        Ok(Self {
            txn_kv,
            clock,
            allow_list,
            config,
            metrics,
        })
    }

    /// Configuration the handlers run with.
    #[must_use]
    pub fn config(&self) -> &MetaServiceConfig {
        &self.config
    }

    /// Metrics sink.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetaServiceMetrics> {
        &self.metrics
    }

    /// Replaces the v2 allow list; affects subsequent requests only.
    pub fn update_lock_v2_allow_list(&self, value: &str) {
        self.allow_list.update(value);
    }

    /// Lock protocol version the instance is routed to.
    #[must_use]
    pub fn get_delete_bitmap_lock_version(&self, instance: &InstanceId) -> LockVersion {
        self.allow_list.version_for(instance)
    }

    // ========================================================================
    // RPC entry points
    // ========================================================================

    /// Acquires, joins or refreshes the delete-bitmap update lock.
    pub async fn get_delete_bitmap_update_lock(
        &self,
        req: &GetDeleteBitmapUpdateLockRequest,
    ) -> GetDeleteBitmapUpdateLockResponse {
        let span = meta_span(GetDeleteBitmapUpdateLockRequest::NAME, &req.instance_id);
        respond(req, self.try_get_lock(req).instrument(span).await)
    }

    /// Releases the caller's hold on the delete-bitmap update lock.
    pub async fn remove_delete_bitmap_update_lock(
        &self,
        req: &RemoveDeleteBitmapUpdateLockRequest,
    ) -> RemoveDeleteBitmapUpdateLockResponse {
        let span = meta_span(RemoveDeleteBitmapUpdateLockRequest::NAME, &req.instance_id);
        respond(req, self.try_remove_lock(req).instrument(span).await)
    }

    /// Writes delete-bitmap entries after verifying the caller holds the lock.
    pub async fn update_delete_bitmap(
        &self,
        req: &UpdateDeleteBitmapRequest,
    ) -> UpdateDeleteBitmapResponse {
        let span = meta_span(UpdateDeleteBitmapRequest::NAME, &req.instance_id);
        respond(req, self.try_update_bitmap(req).instrument(span).await)
    }

    /// Reads delete-bitmap entries of some rowsets within a version range.
    pub async fn get_delete_bitmap(&self, req: &GetDeleteBitmapRequest) -> GetDeleteBitmapResponse {
        let span = meta_span(GetDeleteBitmapRequest::NAME, &req.instance_id);
        respond(req, self.try_get_bitmap(req).instrument(span).await)
    }

    /// Removes every stored entry of some rowsets.
    pub async fn remove_delete_bitmap(
        &self,
        req: &RemoveDeleteBitmapRequest,
    ) -> RemoveDeleteBitmapResponse {
        let span = meta_span(RemoveDeleteBitmapRequest::NAME, &req.instance_id);
        respond(req, self.try_remove_bitmap(req).instrument(span).await)
    }

    // ========================================================================
    // Lock handlers
    // ========================================================================

    async fn try_get_lock(
        &self,
        req: &GetDeleteBitmapUpdateLockRequest,
    ) -> Result<GetDeleteBitmapUpdateLockResponse> {
        let instance = InstanceId::new(&req.instance_id)?;
        let kind = lock_taking_kind(req.lock_id)?;
        let version = self.resolve_version(&instance, req.lock_version)?;
        let table = TableId::new(req.table_id);
        let tablets: Vec<TabletId> = req.tablet_ids.iter().copied().map(TabletId::new).collect();
        let scopes = LockScope::for_request(version, table, &tablets)?;

        let now = self.clock.now();
        let expiration = self.expiration(now, req.expiration_secs)?;

        let mut txn = self.begin().await?;
        let mut transitions = Vec::with_capacity(scopes.len());
        for scope in &scopes {
            let key = scope.key(&instance);
            let current = read_lock(txn.as_mut(), &key).await?;
            match acquire(current.as_ref(), kind, req.initiator, now, expiration) {
                AcquireDecision::Write { record, outcome } => {
                    transitions.push((*scope, key, record, outcome));
                }
                AcquireDecision::Busy { holder } => {
                    self.metrics.record_lock(LockOutcome::Busy);
                    return Err(MetaError::lock_busy(format!(
                        "{scope} is held by lock_id={} initiators={:?} until {}, requested by {kind} initiator={}",
                        holder.lock_id, holder.initiators, holder.expiration, req.initiator
                    )));
                }
            }
        }

        for (_, key, record, _) in &transitions {
            txn.put(key.as_bytes(), record.encode()?);
        }

        let tablet_stats = if req.require_tablet_stats {
            let mut stats = Vec::with_capacity(tablets.len());
            for &tablet in &tablets {
                let key = TabletStatsKey::tablet(&instance, table, tablet);
                stats.push(read_stats(txn.as_mut(), &key, tablet).await?);
            }
            stats
        } else {
            Vec::new()
        };

        let kv_stats = txn.stats();
        txn.commit()
            .await
            .map_err(|code| MetaError::store(code, "commit delete bitmap update lock"))?;
        log_kv_stats(GetDeleteBitmapUpdateLockRequest::NAME, &kv_stats);

        for (scope, _, record, outcome) in &transitions {
            self.metrics.record_lock(*outcome);
            info!(
                %scope,
                %kind,
                outcome = outcome.as_str(),
                lock_id = record.lock_id,
                initiators = ?record.initiators,
                expiration = %record.expiration,
                "delete bitmap update lock granted"
            );
        }

        Ok(GetDeleteBitmapUpdateLockResponse {
            status: MetaStatus::ok(),
            tablet_stats,
        })
    }

    async fn try_remove_lock(
        &self,
        req: &RemoveDeleteBitmapUpdateLockRequest,
    ) -> Result<RemoveDeleteBitmapUpdateLockResponse> {
        let instance = InstanceId::new(&req.instance_id)?;
        let kind = lock_taking_kind(req.lock_id)?;
        let version = self.resolve_version(&instance, req.lock_version)?;
        let tablets: Vec<TabletId> = req.tablet_ids.iter().copied().map(TabletId::new).collect();
        let scopes = LockScope::for_request(version, TableId::new(req.table_id), &tablets)?;

        let mut txn = self.begin().await?;
        let mut outcomes = Vec::with_capacity(scopes.len());
        for scope in &scopes {
            let key = scope.key(&instance);
            let current = read_lock(txn.as_mut(), &key).await?;
            match release(current.as_ref(), kind, req.initiator) {
                ReleaseDecision::Delete => {
                    txn.remove(key.as_bytes());
                    outcomes.push((*scope, LockOutcome::Released));
                }
                ReleaseDecision::Rewrite(record) => {
                    txn.put(key.as_bytes(), record.encode()?);
                    outcomes.push((*scope, LockOutcome::Released));
                }
                ReleaseDecision::Stale { reason } => {
                    warn!(
                        %scope,
                        %kind,
                        initiator = req.initiator,
                        current = ?current,
                        reason,
                        "ignoring release of a delete bitmap update lock the caller does not hold"
                    );
                    outcomes.push((*scope, LockOutcome::StaleRelease));
                }
            }
        }

        let kv_stats = txn.stats();
        txn.commit()
            .await
            .map_err(|code| MetaError::store(code, "commit delete bitmap update lock release"))?;
        log_kv_stats(RemoveDeleteBitmapUpdateLockRequest::NAME, &kv_stats);

        for (scope, outcome) in outcomes {
            self.metrics.record_lock(outcome);
            if outcome == LockOutcome::Released {
                info!(%scope, %kind, initiator = req.initiator, "delete bitmap update lock released");
            }
        }
        Ok(RemoveDeleteBitmapUpdateLockResponse::default())
    }

    // ========================================================================
    // Bitmap handlers
    // ========================================================================

    async fn try_update_bitmap(
        &self,
        req: &UpdateDeleteBitmapRequest,
    ) -> Result<UpdateDeleteBitmapResponse> {
        let instance = InstanceId::new(&req.instance_id)?;
        let kind = LockKind::from_lock_id(req.lock_id)?;
        let table = TableId::new(req.table_id);
        let tablet = TabletId::new(req.tablet_id);

        let mut txn = self.begin().await?;

        if kind != LockKind::LockFreeCompaction {
            let scope = match self.allow_list.version_for(&instance) {
                LockVersion::V1 => LockScope::Table { table },
                LockVersion::V2 => LockScope::Tablet { table, tablet },
            };
            let current = read_lock(txn.as_mut(), &scope.key(&instance)).await?;
            if !holds(current.as_ref(), kind, req.initiator, self.clock.now()) {
                return Err(MetaError::lock_expired(format!(
                    "{scope}: {kind} initiator={} does not hold the delete bitmap update lock, current={current:?}",
                    req.initiator
                )));
            }
        }

        let mut entries_delta = 0i64;
        let mut rows_delta = 0i64;
        for (bitmap_key, rows) in req.bitmap.iter() {
            let key = DeleteBitmapKey::entry(
                &instance,
                tablet,
                &bitmap_key.rowset,
                bitmap_key.segment,
                bitmap_key.version,
            );
            let previous = txn
                .get(key.as_bytes())
                .await
                .map_err(|code| MetaError::store(code, "read delete bitmap"))?;
            match previous {
                Some(bytes) => rows_delta -= cardinality(&decode_rows(&bytes)?),
                None => entries_delta += 1,
            }
            rows_delta += cardinality(rows);
            txn.put(key.as_bytes(), encode_rows(rows)?);
        }

        let stats_key = TabletStatsKey::tablet(&instance, table, tablet);
        apply_stats_delta(txn.as_mut(), &stats_key, tablet, entries_delta, rows_delta).await?;

        let kv_stats = txn.stats();
        txn.commit()
            .await
            .map_err(|code| MetaError::store(code, "commit delete bitmap"))?;
        log_kv_stats(UpdateDeleteBitmapRequest::NAME, &kv_stats);
        debug!(
            tablet = req.tablet_id,
            entries = req.bitmap.len(),
            rows = req.bitmap.cardinality(),
            "updated delete bitmap"
        );
        Ok(UpdateDeleteBitmapResponse::default())
    }

    async fn try_get_bitmap(&self, req: &GetDeleteBitmapRequest) -> Result<GetDeleteBitmapResponse> {
        let instance = InstanceId::new(&req.instance_id)?;
        let tablet = TabletId::new(req.tablet_id);
        if req.begin_version > req.end_version {
            return Err(MetaError::InvalidArgument(format!(
                "begin_version {} is after end_version {}",
                req.begin_version, req.end_version
            )));
        }
        let range = Version::new(req.begin_version)..=Version::new(req.end_version);

        let mut txn = self.begin().await?;
        let mut bitmap = DeleteBitmap::new();
        for rowset in &req.rowset_ids {
            let rowset = RowsetId::new(rowset)?;
            let prefix = DeleteBitmapKey::rowset_prefix(&instance, tablet, &rowset);
            let entries = txn
                .scan_prefix(prefix.as_bytes())
                .await
                .map_err(|code| MetaError::store(code, "scan delete bitmap"))?;
            for (key, value) in entries {
                let (rowset, segment, version) = DeleteBitmapKey::parse_entry(&key).ok_or_else(|| {
                    MetaError::Internal {
                        message: format!("malformed delete bitmap key {}", String::from_utf8_lossy(&key)),
                    }
                })?;
                if range.contains(&version) {
                    bitmap.merge_entry(BitmapKey::new(rowset, segment, version), &decode_rows(&value)?);
                }
            }
        }
        log_kv_stats(GetDeleteBitmapRequest::NAME, &txn.stats());

        Ok(GetDeleteBitmapResponse {
            status: MetaStatus::ok(),
            bitmap,
        })
    }

    async fn try_remove_bitmap(
        &self,
        req: &RemoveDeleteBitmapRequest,
    ) -> Result<RemoveDeleteBitmapResponse> {
        let instance = InstanceId::new(&req.instance_id)?;
        let table = TableId::new(req.table_id);
        let tablet = TabletId::new(req.tablet_id);

        let mut txn = self.begin().await?;
        let mut entries_delta = 0i64;
        let mut rows_delta = 0i64;
        for rowset in &req.rowset_ids {
            let rowset = RowsetId::new(rowset)?;
            let prefix = DeleteBitmapKey::rowset_prefix(&instance, tablet, &rowset);
            let entries = txn
                .scan_prefix(prefix.as_bytes())
                .await
                .map_err(|code| MetaError::store(code, "scan delete bitmap"))?;
            for (key, value) in entries {
                entries_delta -= 1;
                rows_delta -= cardinality(&decode_rows(&value)?);
                txn.remove(&key);
            }
        }

        let stats_key = TabletStatsKey::tablet(&instance, table, tablet);
        apply_stats_delta(txn.as_mut(), &stats_key, tablet, entries_delta, rows_delta).await?;

        let kv_stats = txn.stats();
        txn.commit()
            .await
            .map_err(|code| MetaError::store(code, "commit delete bitmap removal"))?;
        log_kv_stats(RemoveDeleteBitmapRequest::NAME, &kv_stats);
        Ok(RemoveDeleteBitmapResponse::default())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.txn_kv
            .begin()
            .await
            .map_err(|code| MetaError::store(code, "begin transaction"))
    }

    fn resolve_version(
        &self,
        instance: &InstanceId,
        requested: Option<LockVersion>,
    ) -> Result<LockVersion> {
        let routed = self.allow_list.version_for(instance);
        match requested {
            Some(requested) if requested != routed => Err(MetaError::VersionMismatch {
                message: format!(
                    "instance {instance} uses delete bitmap lock {routed}, request uses {requested}"
                ),
            }),
            _ => Ok(routed),
        }
    }

    fn expiration(&self, now: DateTime<Utc>, requested_secs: Option<u64>) -> Result<DateTime<Utc>> {
        let secs = requested_secs.unwrap_or(self.config.lock.default_expiration_secs);
        if secs == 0 {
            return Err(MetaError::InvalidArgument(
                "lock expiration must be positive".to_string(),
            ));
        }
        i64::try_from(secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| MetaError::InvalidArgument(format!("lock expiration {secs}s is out of range")))
    }
}

/// Decodes a lock id for the get/remove-lock handlers, which lock-free
/// compaction never calls.
fn lock_taking_kind(lock_id: i64) -> Result<LockKind> {
    match LockKind::from_lock_id(lock_id)? {
        LockKind::LockFreeCompaction => Err(MetaError::InvalidArgument(
            "lock-free compaction does not take the delete bitmap update lock".to_string(),
        )),
        kind => Ok(kind),
    }
}

async fn read_lock(
    txn: &mut dyn Transaction,
    key: &DeleteBitmapLockKey,
) -> Result<Option<LockRecord>> {
    let value = txn
        .get(key.as_bytes())
        .await
        .map_err(|code| MetaError::store(code, "read delete bitmap update lock"))?;
    value.map(|bytes| LockRecord::decode(&bytes)).transpose()
}

async fn read_stats(
    txn: &mut dyn Transaction,
    key: &TabletStatsKey,
    tablet: TabletId,
) -> Result<TabletStats> {
    let value = txn
        .get(key.as_bytes())
        .await
        .map_err(|code| MetaError::store(code, "read tablet stats"))?;
    match value {
        Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        None => Ok(TabletStats {
            tablet_id: tablet.get(),
            ..TabletStats::default()
        }),
    }
}

async fn apply_stats_delta(
    txn: &mut dyn Transaction,
    key: &TabletStatsKey,
    tablet: TabletId,
    entries_delta: i64,
    rows_delta: i64,
) -> Result<()> {
    if entries_delta == 0 && rows_delta == 0 {
        return Ok(());
    }
    let mut stats = read_stats(txn, key, tablet).await?;
    stats.delete_bitmap_entries = stats.delete_bitmap_entries.saturating_add_signed(entries_delta);
    stats.deleted_rows = stats.deleted_rows.saturating_add_signed(rows_delta);
    txn.put(key.as_bytes(), serde_json::to_vec(&stats)?.into());
    Ok(())
}

fn cardinality(rows: &roaring::RoaringBitmap) -> i64 {
    i64::try_from(rows.len()).unwrap_or(i64::MAX)
}

fn log_kv_stats(method: &'static str, stats: &KvStats) {
    debug!(
        method,
        get_count = stats.get_count,
        put_count = stats.put_count,
        delete_count = stats.delete_count,
        get_bytes = stats.get_bytes,
        put_bytes = stats.put_bytes,
        "kv stats"
    );
}

/// Turns a handler result into a response, logging failures.
fn respond<Req: MetaRequest, Resp: MetaResponse>(req: &Req, result: Result<Resp>) -> Resp {
    match result {
        Ok(resp) => resp,
        Err(err) => {
            let code = err.code();
            if code.is_store_transient() || code == MetaServiceCode::LockConflict {
                info!(method = Req::NAME, %code, error = %err, "request not applied");
            } else {
                warn!(method = Req::NAME, %code, error = %err, request = ?req, "request failed");
            }
            let mut resp = Resp::default();
            *resp.status_mut() = MetaStatus::from(&err);
            resp
        }
    }
}
