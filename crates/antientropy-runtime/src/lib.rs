//! Antientropy runtime: the repair scheduling engine.
//!
//! - [config]: engine and per-table settings.
//! - [lock]: distributed lock service, guards and lease cleanup.
//! - [scheduling]: the generic priority-ordered [ScheduleManager].
//! - [repair]: per-table [RepairState] and [TableRepairJob].
//! - [scheduler]: the [RepairScheduler] registry.
//! - [service]: [RepairSchedulerService] activation and shutdown.
//! - [policy], [rpc], [metrics], [fault]: collaborator contracts.

pub mod config;
pub mod fault;
pub mod lock;
pub mod metrics;
pub mod policy;
pub mod repair;
pub mod rpc;
pub mod scheduler;
pub mod scheduling;
pub mod service;

pub use config::{RepairConfiguration, RepairLockType, SchedulerConfig};
pub use fault::{FaultCode, LoggingFaultReporter, RepairFaultReporter};
#[cfg(feature = "sqlite-persistence")]
pub use lock::SqliteLockService;
pub use lock::{InMemoryLockService, LockFence, LockGuard, LockLease, LockScope, LockService};
pub use metrics::{NoopTableRepairMetrics, TableRepairMetrics};
pub use policy::{RepairPolicy, TableDenyList};
pub use repair::{
    JobStatus, JobView, RepairState, RepairStateSnapshot, TableRepairJob, VnodeRepairState,
};
pub use rpc::RepairRpc;
pub use scheduler::{RepairScheduler, RepairSchedulerBuilder};
pub use scheduling::{BusyReplicas, ScheduleManager, ScheduledJob, ScheduledTask, TaskOutcome};
pub use service::{Collaborators, RepairSchedulerService};
