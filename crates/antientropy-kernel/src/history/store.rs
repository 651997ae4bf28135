//! Storage façade for the repair history table.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::RepairError;
use crate::timeuuid::TimeUuid;

use super::entry::{HistoryRow, RepairStatus};

/// One reverse-chronological page request against a single partition.
#[derive(Clone, Debug)]
pub struct HistoryScan {
    pub table_id: Uuid,
    pub node_id: Uuid,
    /// Inclusive lower bound on `repair_id`.
    pub lower: TimeUuid,
    pub upper: TimeUuid,
    pub upper_inclusive: bool,
    pub limit: usize,
}

impl HistoryScan {
    pub fn admits(&self, repair_id: &TimeUuid) -> bool {
        *repair_id >= self.lower
            && if self.upper_inclusive {
                *repair_id <= self.upper
            } else {
                *repair_id < self.upper
            }
    }
}

/// Repair history contract used by repair sessions and history readers.
///
/// Implementations keep rows partitioned by `(table_id, node_id)`:
/// - `insert` writes one row; rows are never deleted by this crate.
/// - `update_status` must leave absent rows absent and report `false`, so
///   a finish after a partially written start only touches what exists.
/// - `scan_page` must return rows in strictly descending `repair_id` order.
pub trait HistoryStore: Send + Sync {
    /// Persist a new row.
    fn insert(&self, row: &HistoryRow) -> Result<(), RepairError>;

    /// Record the terminal status of an existing row.
    fn update_status(
        &self,
        table_id: Uuid,
        node_id: Uuid,
        repair_id: &TimeUuid,
        status: RepairStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, RepairError>;

    /// Read a single row by its primary key.
    fn get(
        &self,
        table_id: Uuid,
        node_id: Uuid,
        repair_id: &TimeUuid,
    ) -> Result<Option<HistoryRow>, RepairError>;

    /// Read one page of a partition, newest first.
    fn scan_page(&self, scan: &HistoryScan) -> Result<Vec<HistoryRow>, RepairError>;

    /// Fails with [RepairError::Schema] when the backing table cannot be used.
    fn verify_schema(&self) -> Result<(), RepairError> {
        Ok(())
    }
}
