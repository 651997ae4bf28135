//! Admission filters consulted before a range is repaired.

use antientropy_kernel::{TableReference, TokenRange};

/// Vetoes repairs, e.g. outside a maintenance window or under load.
/// Policies compose by AND.
pub trait RepairPolicy: Send + Sync {
    fn allow_repair(&self, table: &TableReference, range: &TokenRange) -> bool;
}

impl<F> RepairPolicy for F
where
    F: Fn(&TableReference, &TokenRange) -> bool + Send + Sync,
{
    fn allow_repair(&self, table: &TableReference, range: &TokenRange) -> bool {
        self(table, range)
    }
}

/// Only lets through ranges of tables not in the deny list.
#[derive(Clone, Debug, Default)]
pub struct TableDenyList {
    denied: Vec<(String, String)>,
}

impl TableDenyList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(mut self, keyspace: impl Into<String>, table: impl Into<String>) -> Self {
        self.denied.push((keyspace.into(), table.into()));
        self
    }
}

impl RepairPolicy for TableDenyList {
    fn allow_repair(&self, table: &TableReference, _range: &TokenRange) -> bool {
        !self
            .denied
            .iter()
            .any(|(ks, tbl)| (ks == &table.keyspace || ks == "*") && tbl == &table.table)
    }
}

pub(crate) fn all_allow(
    policies: &[std::sync::Arc<dyn RepairPolicy>],
    table: &TableReference,
    range: &TokenRange,
) -> bool {
    policies.iter().all(|p| p.allow_repair(table, range))
}
