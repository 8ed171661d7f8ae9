//! Property tests for the lock transitions.
//!
//! Random interleavings of acquire, release and clock advances are applied
//! to a single scope. A model tracks who was granted the lock; after every
//! step the stored record must agree with the model and never admit a job
//! lock alongside any other holder.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, TimeZone, Utc};
use nimbus_meta::lock::{AcquireDecision, LockKind, LockRecord, ReleaseDecision, acquire, release};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Step {
    Acquire { holder: usize, ttl_secs: i64 },
    Release { holder: usize },
    Advance { secs: i64 },
}

/// (kind, initiator) pairs; loads use their txn id as initiator.
fn holders() -> [(LockKind, i64); 6] {
    [
        (LockKind::Compaction, 1),
        (LockKind::Compaction, 2),
        (LockKind::SchemaChange, 3),
        (LockKind::Load { txn_id: 101 }, 101),
        (LockKind::Load { txn_id: 102 }, 102),
        (LockKind::Load { txn_id: 103 }, 103),
    ]
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0..6usize, 1..20i64).prop_map(|(holder, ttl_secs)| Step::Acquire { holder, ttl_secs }),
        3 => (0..6usize).prop_map(|holder| Step::Release { holder }),
        1 => (1..15i64).prop_map(|secs| Step::Advance { secs }),
    ]
}

fn start() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).single().expect("timestamp")
}

proptest! {
    #[test]
    fn record_never_admits_incompatible_holders(steps in prop::collection::vec(step(), 1..60)) {
        let holders = holders();
        let mut now = start();
        let mut record: Option<LockRecord> = None;
        let mut granted: BTreeSet<(i64, i64)> = BTreeSet::new();

        for step in steps {
            match step {
                Step::Acquire { holder, ttl_secs } => {
                    let (kind, initiator) = holders[holder];
                    let expiration = now + Duration::seconds(ttl_secs);
                    match acquire(record.as_ref(), kind, initiator, now, expiration) {
                        AcquireDecision::Write { record: next, outcome } => {
                            if next.initiators.len() == 1 {
                                granted.clear();
                            }
                            granted.insert((kind.lock_id(), initiator));
                            prop_assert!(next.expiration >= expiration, "{outcome:?}");
                            record = Some(next);
                        }
                        AcquireDecision::Busy { holder } => {
                            prop_assert!(!holder.is_expired(now));
                            prop_assert!(!(kind.is_load() && holder.is_load()));
                        }
                    }
                }
                Step::Release { holder } => {
                    let (kind, initiator) = holders[holder];
                    match release(record.as_ref(), kind, initiator) {
                        ReleaseDecision::Delete => {
                            granted.retain(|&(_, i)| i != initiator);
                            prop_assert!(granted.is_empty());
                            record = None;
                        }
                        ReleaseDecision::Rewrite(next) => {
                            granted.retain(|&(_, i)| i != initiator);
                            record = Some(next);
                        }
                        ReleaseDecision::Stale { .. } => {}
                    }
                }
                Step::Advance { secs } => now += Duration::seconds(secs),
            }

            match &record {
                None => prop_assert!(granted.is_empty()),
                Some(r) => {
                    let initiators: BTreeSet<i64> = granted.iter().map(|&(_, i)| i).collect();
                    prop_assert_eq!(&r.initiators, &initiators);
                    if granted.iter().any(|&(lock_id, _)| lock_id < 0) {
                        prop_assert_eq!(granted.len(), 1);
                        prop_assert!(!r.is_load());
                    } else {
                        prop_assert!(r.is_load());
                    }
                }
            }
        }
    }
}
