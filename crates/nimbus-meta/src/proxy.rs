//! Client-facing entry point of the meta service.
//!
//! [`MetaServiceProxy`] runs every RPC through the retry wrapper and, once
//! the call succeeded, offers it to the replay injector. Callers never see
//! the retries or the replays.

use std::sync::Arc;

use nimbus_core::id::InstanceId;

use crate::lock::LockVersion;
use crate::replay::IdempotentReplayInjector;
use crate::retry::{RetryPolicy, call_with_policy};
use crate::rpc::{
    GetDeleteBitmapRequest, GetDeleteBitmapResponse, GetDeleteBitmapUpdateLockRequest,
    GetDeleteBitmapUpdateLockResponse, MetaRequest, RemoveDeleteBitmapRequest,
    RemoveDeleteBitmapResponse, RemoveDeleteBitmapUpdateLockRequest,
    RemoveDeleteBitmapUpdateLockResponse, UpdateDeleteBitmapRequest, UpdateDeleteBitmapResponse,
};
use crate::service::MetaServiceImpl;

macro_rules! proxied_rpc {
    ($(#[$doc:meta])* $method:ident($req:ty) -> $resp:ty) => {
        $(#[$doc])*
        pub async fn $method(&self, req: &$req) -> $resp {
            let resp = call_with_policy(
                &self.policy,
                <$req as MetaRequest>::NAME,
                self.service.metrics(),
                || self.service.$method(req),
            )
            .await;
            let service = Arc::clone(&self.service);
            let _ = self.replay.maybe_replay(req, &resp, move |copy: $req| async move {
                service.$method(&copy).await
            });
            resp
        }
    };
}

/// Retrying, replay-injecting front of a [`MetaServiceImpl`].
#[derive(Debug)]
pub struct MetaServiceProxy {
    service: Arc<MetaServiceImpl>,
    policy: RetryPolicy,
    replay: IdempotentReplayInjector,
}

impl MetaServiceProxy {
    /// Fronts `service` with the retry and replay settings of its config.
    #[must_use]
    pub fn new(service: Arc<MetaServiceImpl>) -> Self {
        let policy = RetryPolicy::from_config(&service.config().retry);
        let replay = IdempotentReplayInjector::new(
            service.config().replay.clone(),
            Arc::clone(service.metrics()),
        );
        Self {
            service,
            policy,
            replay,
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the replay injector.
    #[must_use]
    pub fn with_replay_injector(mut self, replay: IdempotentReplayInjector) -> Self {
        self.replay = replay;
        self
    }

    /// The wrapped handlers.
    #[must_use]
    pub fn service(&self) -> &Arc<MetaServiceImpl> {
        &self.service
    }

    /// Lock protocol version the instance is routed to.
    #[must_use]
    pub fn get_delete_bitmap_lock_version(&self, instance: &InstanceId) -> LockVersion {
        self.service.get_delete_bitmap_lock_version(instance)
    }

    proxied_rpc! {
        /// See [`MetaServiceImpl::get_delete_bitmap_update_lock`].
        get_delete_bitmap_update_lock(GetDeleteBitmapUpdateLockRequest) -> GetDeleteBitmapUpdateLockResponse
    }

    proxied_rpc! {
        /// See [`MetaServiceImpl::remove_delete_bitmap_update_lock`].
        remove_delete_bitmap_update_lock(RemoveDeleteBitmapUpdateLockRequest) -> RemoveDeleteBitmapUpdateLockResponse
    }

    proxied_rpc! {
        /// See [`MetaServiceImpl::update_delete_bitmap`].
        update_delete_bitmap(UpdateDeleteBitmapRequest) -> UpdateDeleteBitmapResponse
    }

    proxied_rpc! {
        /// See [`MetaServiceImpl::get_delete_bitmap`].
        get_delete_bitmap(GetDeleteBitmapRequest) -> GetDeleteBitmapResponse
    }

    proxied_rpc! {
        /// See [`MetaServiceImpl::remove_delete_bitmap`].
        remove_delete_bitmap(RemoveDeleteBitmapRequest) -> RemoveDeleteBitmapResponse
    }
}
