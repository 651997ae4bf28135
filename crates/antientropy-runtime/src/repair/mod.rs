//! Table repair jobs and the state they are driven by.

pub mod job;
pub mod state;

pub use job::{JobStatus, JobView, RepairJobContext, RepairTask, TableRepairJob};
pub use state::{RepairState, RepairStateSnapshot, VnodeRepairState};
