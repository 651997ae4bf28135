//! Per-table repair metrics sink.

use std::time::Duration;

use antientropy_kernel::{TableReference, TokenRange};
use chrono::{DateTime, Utc};

pub trait TableRepairMetrics: Send + Sync {
    /// One sub-task finished, successfully or not.
    fn repair_session(
        &self,
        table: &TableReference,
        range: &TokenRange,
        duration: Duration,
        success: bool,
    );

    /// The table's repaired-at time after a state refresh.
    fn last_repaired_at(&self, table: &TableReference, repaired_at: DateTime<Utc>);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTableRepairMetrics;

impl TableRepairMetrics for NoopTableRepairMetrics {
    fn repair_session(&self, _: &TableReference, _: &TokenRange, _: Duration, _: bool) {}

    fn last_repaired_at(&self, _: &TableReference, _: DateTime<Utc>) {}
}
