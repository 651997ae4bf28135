//! Process-local lock service.

use std::collections::HashMap;
use std::sync::Mutex;

use antientropy_kernel::RepairError;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{LockLease, LockService};

/// Lock service for a single process or for tests.
#[derive(Debug, Default)]
pub struct InMemoryLockService {
    leases: Mutex<HashMap<String, LockLease>>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `resource`, if its lease is still live.
    pub fn holder(&self, resource: &str) -> Option<String> {
        let leases = self.leases.lock().ok()?;
        leases
            .get(resource)
            .filter(|l| l.expires_at >= Utc::now())
            .map(|l| l.holder.clone())
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, LockLease>>, RepairError> {
        self.leases
            .lock()
            .map_err(|_| RepairError::Driver("in-memory lock table poisoned".to_string()))
    }
}

impl LockService for InMemoryLockService {
    fn try_acquire(
        &self,
        resource: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<LockLease, RepairError> {
        let now = Utc::now();
        let mut leases = self.lock()?;
        let version = match leases.get(resource) {
            Some(current) if current.expires_at >= now => {
                return Err(RepairError::LockBusy(format!(
                    "{} is held by {}",
                    resource, current.holder
                )));
            }
            Some(expired) => expired.version + 1,
            None => 1,
        };
        let lease = LockLease {
            lease_id: format!("lease-{}", Uuid::new_v4()),
            resource: resource.to_string(),
            holder: holder.to_string(),
            expires_at,
            version,
        };
        leases.insert(resource.to_string(), lease.clone());
        Ok(lease)
    }

    fn refresh(
        &self,
        lease: &LockLease,
        expires_at: DateTime<Utc>,
    ) -> Result<LockLease, RepairError> {
        let now = Utc::now();
        let mut leases = self.lock()?;
        match leases.get_mut(&lease.resource) {
            Some(current) if current.lease_id == lease.lease_id && current.expires_at >= now => {
                current.expires_at = expires_at;
                current.version += 1;
                Ok(current.clone())
            }
            _ => Err(RepairError::LockBusy(format!(
                "lease on {} was lost",
                lease.resource
            ))),
        }
    }

    fn release(&self, lease: &LockLease) -> Result<(), RepairError> {
        let mut leases = self.lock()?;
        if leases
            .get(&lease.resource)
            .is_some_and(|current| current.lease_id == lease.lease_id)
        {
            leases.remove(&lease.resource);
        }
        Ok(())
    }

    fn expire(&self, cutoff: DateTime<Utc>) -> Result<u64, RepairError> {
        let mut leases = self.lock()?;
        let before = leases.len();
        leases.retain(|_, l| l.expires_at >= cutoff);
        Ok((before - leases.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn busy_until_released() {
        let service = InMemoryLockService::new();
        let later = Utc::now() + Duration::seconds(30);
        let lease = service.try_acquire("r", "a", later).expect("acquire");
        assert_eq!(lease.version, 1);
        assert_eq!(service.holder("r").as_deref(), Some("a"));
        assert!(matches!(
            service.try_acquire("r", "b", later),
            Err(RepairError::LockBusy(_))
        ));
        service.release(&lease).expect("release");
        assert!(service.holder("r").is_none());
        service.try_acquire("r", "b", later).expect("free again");
    }

    #[test]
    fn stale_release_does_not_drop_new_holder() {
        let service = InMemoryLockService::new();
        let past = Utc::now() - Duration::seconds(1);
        let stale = service.try_acquire("r", "a", past).expect("acquire");
        let fresh = service
            .try_acquire("r", "b", Utc::now() + Duration::seconds(30))
            .expect("takeover");
        assert_eq!(fresh.version, stale.version + 1);
        service.release(&stale).expect("stale release");
        assert_eq!(service.holder("r").as_deref(), Some("b"));
    }

    #[test]
    fn expire_drops_only_old_leases() {
        let service = InMemoryLockService::new();
        let now = Utc::now();
        service
            .try_acquire("old", "a", now - Duration::seconds(10))
            .expect("old");
        service
            .try_acquire("new", "a", now + Duration::seconds(10))
            .expect("new");
        assert_eq!(service.expire(now).expect("expire"), 1);
        assert_eq!(service.holder("new").as_deref(), Some("a"));
    }
}
