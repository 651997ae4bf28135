//! Periodic cleanup of expired lock leases.

use std::sync::Arc;

use antientropy_kernel::RepairError;
use chrono::{DateTime, Duration, Utc};

use super::LockService;

/// Lease behavior tuning knobs.
#[derive(Clone, Debug)]
pub struct LeaseConfig {
    /// Lifetime granted by each acquire or refresh.
    pub lease_ttl: Duration,
    /// Leases are only reclaimed once they are this far past expiry.
    pub heartbeat_grace: Duration,
}

impl LeaseConfig {
    /// Holders refresh three times per ttl, so one missed beat never loses a lease.
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        (self.lease_ttl / 3)
            .to_std()
            .unwrap_or(std::time::Duration::from_millis(1))
    }

    /// [LeaseConfig::lease_ttl] as a std duration for lock acquisition.
    pub fn ttl(&self) -> std::time::Duration {
        self.lease_ttl.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::minutes(10),
            heartbeat_grace: Duration::seconds(5),
        }
    }
}

/// Result of a periodic lease tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaseTickResult {
    pub expired: u64,
}

/// Lease manager abstraction.
pub trait LeaseManager: Send + Sync {
    fn tick(&self, now: DateTime<Utc>) -> Result<LeaseTickResult, RepairError>;
}

/// Lease manager reclaiming stale leases of a [LockService].
pub struct LockLeaseManager {
    service: Arc<dyn LockService>,
    config: LeaseConfig,
}

impl LockLeaseManager {
    pub fn new(service: Arc<dyn LockService>, config: LeaseConfig) -> Self {
        Self { service, config }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }
}

impl LeaseManager for LockLeaseManager {
    fn tick(&self, now: DateTime<Utc>) -> Result<LeaseTickResult, RepairError> {
        let expired = self.service.expire(now - self.config.heartbeat_grace)?;
        Ok(LeaseTickResult { expired })
    }
}
