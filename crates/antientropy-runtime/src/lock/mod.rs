//! Distributed lock service used to serialise repairs across processes.
//!
//! A lock is a lease on a named resource with a bounded lifetime. Holders
//! refresh the lease before doing work; an expired lease may be taken over
//! by anyone, so a failed refresh means the work must not start.

pub mod lease;
pub mod memory;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use antientropy_kernel::{Node, RepairError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, error, warn};

use crate::config::RepairLockType;

pub use lease::{LeaseConfig, LeaseManager, LeaseTickResult, LockLeaseManager};
pub use memory::InMemoryLockService;
#[cfg(feature = "sqlite-persistence")]
pub use sqlite::SqliteLockService;

/// Key under which mutual exclusion is requested.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LockScope {
    Datacenter(String),
    /// Hex SHA-256 digest of the replica ids, in ascending order.
    Vnode(String),
}

impl LockScope {
    pub fn vnode(replicas: &BTreeSet<Node>) -> Self {
        let ids: BTreeSet<_> = replicas.iter().map(|n| n.id).collect();
        let mut hasher = Sha256::new();
        for id in ids {
            hasher.update(id.as_bytes());
        }
        Self::Vnode(hex::encode(hasher.finalize()))
    }

    /// Scopes to hold for a task touching `replicas`, datacenters first.
    pub fn for_replicas(lock_type: RepairLockType, replicas: &BTreeSet<Node>) -> Vec<Self> {
        let datacenters = || {
            replicas
                .iter()
                .map(|n| n.datacenter.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(Self::Datacenter)
        };
        match lock_type {
            RepairLockType::Vnode => vec![Self::vnode(replicas)],
            RepairLockType::Datacenter => datacenters().collect(),
            RepairLockType::DatacenterAndVnode => datacenters()
                .chain(std::iter::once(Self::vnode(replicas)))
                .collect(),
        }
    }

    pub fn resource(&self) -> String {
        match self {
            Self::Datacenter(dc) => format!("repair/datacenter/{dc}"),
            Self::Vnode(digest) => format!("repair/vnode/{digest}"),
        }
    }
}

/// A lease held on one resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub lease_id: String,
    pub resource: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
}

/// Lock service contract.
///
/// - `try_acquire` never blocks; a live lease held by anyone yields
///   [RepairError::LockBusy].
/// - `refresh` extends a lease that is still current, otherwise
///   [RepairError::LockBusy].
/// - `release` of a lease that is no longer current is a no-op.
pub trait LockService: Send + Sync {
    fn try_acquire(
        &self,
        resource: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<LockLease, RepairError>;

    fn refresh(&self, lease: &LockLease, expires_at: DateTime<Utc>)
        -> Result<LockLease, RepairError>;

    fn release(&self, lease: &LockLease) -> Result<(), RepairError>;

    /// Drop every lease that expired before `cutoff`. Returns how many.
    fn expire(&self, cutoff: DateTime<Utc>) -> Result<u64, RepairError>;
}

fn expiry_after(ttl: Duration) -> Result<DateTime<Utc>, RepairError> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| RepairError::Config(format!("invalid lock ttl: {e}")))?;
    Ok(Utc::now() + ttl)
}

/// Leases on a set of scopes, released on drop.
pub struct LockGuard {
    service: Arc<dyn LockService>,
    leases: Vec<LockLease>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("leases", &self.leases)
            .finish()
    }
}

impl LockGuard {
    /// Acquires every scope or none of them.
    pub fn acquire(
        service: Arc<dyn LockService>,
        scopes: &[LockScope],
        holder: &str,
        ttl: Duration,
    ) -> Result<Self, RepairError> {
        let expires_at = expiry_after(ttl)?;
        let mut guard = Self {
            service,
            leases: Vec::with_capacity(scopes.len()),
        };
        for scope in scopes {
            // On error the partially filled guard is dropped and releases what it holds.
            let lease = guard
                .service
                .try_acquire(&scope.resource(), holder, expires_at)?;
            guard.leases.push(lease);
        }
        Ok(guard)
    }

    /// [LockGuard::acquire], retried while busy up to `attempts` times.
    pub fn acquire_with_retry(
        service: Arc<dyn LockService>,
        scopes: &[LockScope],
        holder: &str,
        ttl: Duration,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self, RepairError> {
        let mut attempt = 1;
        loop {
            match Self::acquire(service.clone(), scopes, holder, ttl) {
                Err(RepairError::LockBusy(reason)) if attempt < attempts => {
                    debug!(attempt, reason = %reason, "lock busy, retrying");
                    attempt += 1;
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    /// Extends every lease. Fails if any lease was lost in the meantime.
    pub fn refresh(&mut self, ttl: Duration) -> Result<(), RepairError> {
        let expires_at = expiry_after(ttl)?;
        for lease in &mut self.leases {
            *lease = self.service.refresh(lease, expires_at)?;
        }
        Ok(())
    }

    pub fn leases(&self) -> &[LockLease] {
        &self.leases
    }

    /// Runs `work` on the calling thread while a heartbeat refreshes every
    /// lease each `heartbeat`. The fence handed to `work` stops reporting
    /// the locks as held once a refresh fails; the heartbeat then stops.
    pub fn hold_while<R>(
        &mut self,
        ttl: Duration,
        heartbeat: Duration,
        work: impl FnOnce(&LockFence) -> R,
    ) -> R {
        let fence = LockFence::default();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let period = heartbeat.max(Duration::from_millis(1));
        let guard = self;
        std::thread::scope(|scope| {
            // Dropped on unwind too, which ends the heartbeat.
            let stop_tx = stop_tx;
            let fence_ref = &fence;
            scope.spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = guard.refresh(ttl) {
                            let resources: Vec<&str> =
                                guard.leases.iter().map(|l| l.resource.as_str()).collect();
                            error!(
                                resources = ?resources,
                                error = %e,
                                "lock lost while work was running"
                            );
                            fence_ref.lost.store(true, Ordering::SeqCst);
                            return;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            });
            let result = work(fence_ref);
            let _ = stop_tx.send(());
            result
        })
    }
}

/// Tells work running under [LockGuard::hold_while] whether its locks are
/// still held.
#[derive(Debug, Default)]
pub struct LockFence {
    lost: AtomicBool,
}

impl LockFence {
    pub fn is_held(&self) -> bool {
        !self.lost.load(Ordering::SeqCst)
    }

    /// Error to fail work with once [LockFence::is_held] turned false.
    pub fn check(&self) -> Result<(), RepairError> {
        if self.is_held() {
            Ok(())
        } else {
            Err(RepairError::LockBusy("lock lost during execution".to_string()))
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        for lease in self.leases.drain(..).rev() {
            if let Err(e) = self.service.release(&lease) {
                warn!(resource = %lease.resource, error = %e, "failed to release lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn replicas(nodes: &[(Uuid, &str)]) -> BTreeSet<Node> {
        nodes.iter().map(|(id, dc)| Node::new(*id, *dc)).collect()
    }

    #[test]
    fn vnode_scope_depends_on_replica_ids_only() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let one = LockScope::vnode(&replicas(&[(a, "dc1"), (b, "dc2")]));
        let two = LockScope::vnode(&replicas(&[(b, "dc2"), (a, "dc1")]));
        assert_eq!(one, two);
        let other = LockScope::vnode(&replicas(&[(a, "dc1")]));
        assert_ne!(one, other);
        match one {
            LockScope::Vnode(digest) => assert_eq!(digest.len(), 64),
            LockScope::Datacenter(_) => panic!("expected vnode scope"),
        }
    }

    #[test]
    fn scopes_follow_lock_type() {
        let set = replicas(&[
            (Uuid::new_v4(), "dc2"),
            (Uuid::new_v4(), "dc1"),
            (Uuid::new_v4(), "dc1"),
        ]);
        assert_eq!(LockScope::for_replicas(RepairLockType::Vnode, &set).len(), 1);
        assert_eq!(
            LockScope::for_replicas(RepairLockType::Datacenter, &set),
            vec![
                LockScope::Datacenter("dc1".into()),
                LockScope::Datacenter("dc2".into())
            ]
        );
        let both = LockScope::for_replicas(RepairLockType::DatacenterAndVnode, &set);
        assert_eq!(both.len(), 3);
        assert!(matches!(both[2], LockScope::Vnode(_)));
    }

    #[test]
    fn guard_is_all_or_nothing_and_releases_on_drop() {
        let service: Arc<dyn LockService> = Arc::new(InMemoryLockService::new());
        let dc1 = LockScope::Datacenter("dc1".into());
        let dc2 = LockScope::Datacenter("dc2".into());
        let ttl = Duration::from_secs(60);

        let held = LockGuard::acquire(service.clone(), &[dc2.clone()], "a", ttl).expect("dc2");
        let err = LockGuard::acquire(service.clone(), &[dc1.clone(), dc2.clone()], "b", ttl)
            .expect_err("dc2 is busy");
        assert!(matches!(err, RepairError::LockBusy(_)));
        // dc1 was released when the partial guard dropped.
        let dc1_guard = LockGuard::acquire(service.clone(), &[dc1], "c", ttl).expect("dc1 free");
        drop(dc1_guard);

        drop(held);
        LockGuard::acquire(service, &[dc2], "b", ttl).expect("dc2 free after drop");
    }

    #[test]
    fn retry_gives_up_after_attempts() {
        let service: Arc<dyn LockService> = Arc::new(InMemoryLockService::new());
        let scope = [LockScope::Datacenter("dc1".into())];
        let _held =
            LockGuard::acquire(service.clone(), &scope, "a", Duration::from_secs(60)).expect("held");
        let err = LockGuard::acquire_with_retry(
            service,
            &scope,
            "b",
            Duration::from_secs(60),
            3,
            Duration::from_millis(1),
        )
        .expect_err("still busy");
        assert!(matches!(err, RepairError::LockBusy(_)));
    }

    #[test]
    fn heartbeat_keeps_leases_alive_past_their_ttl() {
        let service = Arc::new(InMemoryLockService::new());
        let scope = [LockScope::Datacenter("dc1".into())];
        let ttl = Duration::from_millis(60);
        let mut guard =
            LockGuard::acquire(service.clone(), &scope, "a", ttl).expect("acquire");
        let stolen = guard.hold_while(ttl, ttl / 3, |fence| {
            std::thread::sleep(ttl * 4);
            let stolen =
                LockGuard::acquire(service.clone(), &scope, "b", Duration::from_secs(60)).is_ok();
            (stolen, fence.is_held())
        });
        assert_eq!(stolen, (false, true));
        assert_eq!(service.holder("repair/datacenter/dc1").as_deref(), Some("a"));
    }

    #[test]
    fn heartbeat_trips_the_fence_when_a_lease_is_lost() {
        let service = Arc::new(InMemoryLockService::new());
        let scope = [LockScope::Datacenter("dc1".into())];
        let mut guard = LockGuard::acquire(service.clone(), &scope, "a", Duration::from_millis(1))
            .expect("acquire");
        std::thread::sleep(Duration::from_millis(5));
        let _thief = LockGuard::acquire(service.clone(), &scope, "b", Duration::from_secs(60))
            .expect("expired lease is free");
        let held = guard.hold_while(Duration::from_secs(60), Duration::from_millis(5), |fence| {
            std::thread::sleep(Duration::from_millis(100));
            fence.check()
        });
        assert!(matches!(held, Err(RepairError::LockBusy(_))));
    }

    #[test]
    fn refresh_fails_once_the_lease_was_taken_over() {
        let service = Arc::new(InMemoryLockService::new());
        let scope = [LockScope::Datacenter("dc1".into())];
        let mut guard = LockGuard::acquire(
            service.clone(),
            &scope,
            "a",
            Duration::from_millis(1),
        )
        .expect("acquire");
        std::thread::sleep(Duration::from_millis(5));
        let _thief = LockGuard::acquire(service.clone(), &scope, "b", Duration::from_secs(60))
            .expect("expired lease is free");
        assert!(matches!(
            guard.refresh(Duration::from_secs(60)),
            Err(RepairError::LockBusy(_))
        ));
    }
}
