//! Generic priority-ordered task runner.
//!
//! Jobs hand out tasks one at a time; the [ScheduleManager] holds the
//! task's distributed locks while it runs and keeps tasks with overlapping
//! replicas apart inside this process.

pub mod manager;

use std::collections::BTreeSet;

use antientropy_kernel::{Node, RepairError};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::lock::{LockFence, LockScope};

pub use manager::{ScheduleManager, TaskOutcome};

/// A unit of work bound to a replica set.
///
/// Dropping a task without executing it hands it back to its job.
pub trait ScheduledTask: Send {
    fn replicas(&self) -> &BTreeSet<Node>;

    /// Locks to hold for the whole execution.
    fn lock_scopes(&self) -> Vec<LockScope>;

    /// Runs with the locks held. `fence` turns false if a lock is lost
    /// meanwhile; the outcome must then not be trusted.
    fn execute(self: Box<Self>, fence: &LockFence) -> Result<(), RepairError>;
}

pub trait ScheduledJob: Send + Sync {
    fn id(&self) -> Uuid;

    /// Rebuild whatever state priority and task selection depend on.
    /// Called once per tick before the job is consulted.
    fn refresh(&self, now: DateTime<Utc>) -> Result<(), RepairError>;

    /// Higher runs first; zero or less means nothing to do right now.
    fn priority(&self, now: DateTime<Utc>) -> i64;

    /// Next task not touching any of `busy`, if the job has one to give.
    fn next_task(&self, now: DateTime<Utc>, busy: &BusyReplicas)
        -> Option<Box<dyn ScheduledTask>>;

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Nodes currently taking part in a task executed by this process.
#[derive(Clone, Debug, Default)]
pub struct BusyReplicas {
    nodes: BTreeSet<Uuid>,
}

impl BusyReplicas {
    pub fn overlaps(&self, replicas: &BTreeSet<Node>) -> bool {
        replicas.iter().any(|n| self.nodes.contains(&n.id))
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn claim(&mut self, replicas: &BTreeSet<Node>) {
        self.nodes.extend(replicas.iter().map(|n| n.id));
    }

    fn unclaim(&mut self, replicas: &BTreeSet<Node>) {
        for node in replicas {
            self.nodes.remove(&node.id);
        }
    }
}
