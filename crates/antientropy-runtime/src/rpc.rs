//! The call that actually runs a repair on the database.

use std::collections::BTreeSet;

use antientropy_kernel::{Node, RepairError, TableReference, TokenRange};

/// Runs a repair of `range` of `table` across `participants` and blocks
/// until the database reports an outcome. Any error means the repair failed.
pub trait RepairRpc: Send + Sync {
    fn run_repair(
        &self,
        table: &TableReference,
        range: &TokenRange,
        participants: &BTreeSet<Node>,
    ) -> Result<(), RepairError>;
}

impl<F> RepairRpc for F
where
    F: Fn(&TableReference, &TokenRange, &BTreeSet<Node>) -> Result<(), RepairError> + Send + Sync,
{
    fn run_repair(
        &self,
        table: &TableReference,
        range: &TokenRange,
        participants: &BTreeSet<Node>,
    ) -> Result<(), RepairError> {
        self(table, range, participants)
    }
}
