//! Replication-topology contract.
//!
//! Topology discovery lives outside this crate; the repair history and the
//! scheduler only consume the mapping from token ranges to replica nodes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use crate::identity::{Node, TableReference};
use crate::token::TokenRange;

/// Maps `(table, token range)` to the nodes replicating it.
pub trait ReplicationState: Send + Sync {
    /// Replica sets of every token range of `table` that includes the local node.
    fn token_range_to_replicas(&self, table: &TableReference) -> BTreeMap<TokenRange, BTreeSet<Node>>;

    /// Replica sets of every token range of `table` across the cluster.
    fn cluster_wide_token_range_to_replicas(
        &self,
        table: &TableReference,
    ) -> BTreeMap<TokenRange, BTreeSet<Node>>;

    /// Replicas of `range`, empty when the local node does not replicate it.
    fn replicas_for(&self, table: &TableReference, range: &TokenRange) -> BTreeSet<Node> {
        self.token_range_to_replicas(table)
            .remove(range)
            .unwrap_or_default()
    }

    /// Replicas of `range` anywhere in the cluster, empty when unknown.
    fn cluster_wide_replicas_for(&self, table: &TableReference, range: &TokenRange) -> BTreeSet<Node> {
        self.cluster_wide_token_range_to_replicas(table)
            .remove(range)
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct TableTopology {
    local: BTreeMap<TokenRange, BTreeSet<Node>>,
    remote: BTreeMap<TokenRange, BTreeSet<Node>>,
}

/// Topology held in memory and replaced by whoever observes the cluster.
///
/// Ranges registered with [StaticReplicationState::set_local_range] are
/// visible both locally and cluster wide; remote ranges only cluster wide.
#[derive(Default)]
pub struct StaticReplicationState {
    tables: RwLock<HashMap<TableReference, TableTopology>>,
}

impl StaticReplicationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_local_range(
        &self,
        table: &TableReference,
        range: TokenRange,
        replicas: impl IntoIterator<Item = Node>,
    ) {
        if let Ok(mut tables) = self.tables.write() {
            tables
                .entry(table.clone())
                .or_default()
                .local
                .insert(range, replicas.into_iter().collect());
        }
    }

    pub fn set_remote_range(
        &self,
        table: &TableReference,
        range: TokenRange,
        replicas: impl IntoIterator<Item = Node>,
    ) {
        if let Ok(mut tables) = self.tables.write() {
            tables
                .entry(table.clone())
                .or_default()
                .remote
                .insert(range, replicas.into_iter().collect());
        }
    }

    pub fn remove_range(&self, table: &TableReference, range: &TokenRange) {
        if let Ok(mut tables) = self.tables.write() {
            if let Some(topology) = tables.get_mut(table) {
                topology.local.remove(range);
                topology.remote.remove(range);
            }
        }
    }

    pub fn remove_table(&self, table: &TableReference) {
        if let Ok(mut tables) = self.tables.write() {
            tables.remove(table);
        }
    }
}

impl ReplicationState for StaticReplicationState {
    fn token_range_to_replicas(&self, table: &TableReference) -> BTreeMap<TokenRange, BTreeSet<Node>> {
        self.tables
            .read()
            .ok()
            .and_then(|tables| tables.get(table).map(|t| t.local.clone()))
            .unwrap_or_default()
    }

    fn cluster_wide_token_range_to_replicas(
        &self,
        table: &TableReference,
    ) -> BTreeMap<TokenRange, BTreeSet<Node>> {
        self.tables
            .read()
            .ok()
            .and_then(|tables| {
                tables.get(table).map(|t| {
                    let mut all = t.remote.clone();
                    all.extend(t.local.iter().map(|(r, n)| (*r, n.clone())));
                    all
                })
            })
            .unwrap_or_default()
    }
}
