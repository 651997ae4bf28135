//! # antientropy
//!
//! Autonomous repair orchestration for a wide-column database. Every node
//! runs one [RepairSchedulerService]: it keeps a [TableRepairJob] per
//! configured table, ranks overdue token ranges by priority, takes a
//! cluster-wide [LockGuard] over the replicas and records each repair
//! session in the shared [RepairHistory].
//!
//! - [kernel]: identities, token ranges, time-ordered ids and repair history.
//! - [runtime]: configuration, locks, the schedule manager and repair jobs.
//!
//! Enable `sqlite-persistence` for the SQLite history store and lock
//! service, `kernel-postgres` for the Postgres history store.

pub use antientropy_kernel as kernel;
pub use antientropy_runtime as runtime;

pub use antientropy_kernel::{
    HistoryStore, InMemoryHistoryStore, Node, RepairEntry, RepairError, RepairHistory,
    RepairHistoryProvider, RepairSession, RepairStatus, ReplicationState,
    StaticReplicationState, TableReference, TimeUuid, TokenRange,
};
pub use antientropy_runtime::{
    Collaborators, FaultCode, InMemoryLockService, JobStatus, JobView, LockGuard, LockService,
    RepairConfiguration, RepairFaultReporter, RepairLockType, RepairPolicy, RepairRpc,
    RepairScheduler, RepairSchedulerService, SchedulerConfig, TableRepairJob,
    TableRepairMetrics,
};
