//! Per-table repair progress derived from the history.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use antientropy_kernel::{
    Node, RepairEntry, RepairError, RepairHistoryProvider, RepairStatus, ReplicationState,
    TableReference, TokenRange,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// One replica range of a table and when all of its replicas were last
/// repaired together.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VnodeRepairState {
    pub range: TokenRange,
    pub replicas: BTreeSet<Node>,
    /// Minimum over the replicas of their latest successful repair; `None`
    /// when any replica has none within the lookback window.
    pub last_repaired_at: Option<DateTime<Utc>>,
}

/// Immutable view of a table's progress at `created_at`.
#[derive(Clone, Debug, Serialize)]
pub struct RepairStateSnapshot {
    pub table: TableReference,
    pub created_at: DateTime<Utc>,
    /// Sorted by range.
    pub ranges: Vec<VnodeRepairState>,
    /// Indices into `ranges`, most overdue first.
    #[serde(skip)]
    overdue: Vec<usize>,
}

impl RepairStateSnapshot {
    pub fn empty(table: TableReference) -> Self {
        Self {
            table,
            created_at: DateTime::<Utc>::MIN_UTC,
            ranges: Vec::new(),
            overdue: Vec::new(),
        }
    }

    pub fn new(
        table: TableReference,
        created_at: DateTime<Utc>,
        mut ranges: Vec<VnodeRepairState>,
        repair_interval: Duration,
    ) -> Self {
        ranges.sort_by(|a, b| a.range.cmp(&b.range));
        let interval = chrono::Duration::from_std(repair_interval).unwrap_or(chrono::Duration::MAX);
        let mut overdue: Vec<usize> = ranges
            .iter()
            .enumerate()
            .filter(|(_, r)| match r.last_repaired_at {
                None => true,
                Some(at) => created_at.signed_duration_since(at) > interval,
            })
            .map(|(i, _)| i)
            .collect();
        // Never-repaired sorts before any timestamp; ties fall back to range order.
        overdue.sort_by(|&a, &b| {
            ranges[a]
                .last_repaired_at
                .cmp(&ranges[b].last_repaired_at)
                .then_with(|| ranges[a].range.cmp(&ranges[b].range))
        });
        Self {
            table,
            created_at,
            ranges,
            overdue,
        }
    }

    /// Oldest successful repair across every range; `None` if any range was never repaired.
    pub fn repaired_at(&self) -> Option<DateTime<Utc>> {
        if self.ranges.is_empty() {
            return None;
        }
        self.ranges
            .iter()
            .map(|r| r.last_repaired_at)
            .collect::<Option<Vec<_>>>()
            .and_then(|times| times.into_iter().min())
    }

    /// Ranges due for repair, most overdue first.
    pub fn overdue(&self) -> impl Iterator<Item = &VnodeRepairState> + '_ {
        self.overdue.iter().map(|&i| &self.ranges[i])
    }

    pub fn is_overdue(&self, range: &TokenRange) -> bool {
        self.overdue().any(|r| &r.range == range)
    }

    /// Share of ranges repaired within the interval.
    pub fn repaired_ratio(&self) -> f64 {
        if self.ranges.is_empty() {
            return 1.0;
        }
        (self.ranges.len() - self.overdue.len()) as f64 / self.ranges.len() as f64
    }
}

/// Per-table state, rebuilt from the history on every refresh.
pub struct RepairState {
    table: TableReference,
    history: Arc<dyn RepairHistoryProvider>,
    replication_state: Arc<dyn ReplicationState>,
    lookback: chrono::Duration,
    snapshot: RwLock<Arc<RepairStateSnapshot>>,
}

impl RepairState {
    pub fn new(
        table: TableReference,
        history: Arc<dyn RepairHistoryProvider>,
        replication_state: Arc<dyn ReplicationState>,
        lookback: chrono::Duration,
    ) -> Self {
        let snapshot = RwLock::new(Arc::new(RepairStateSnapshot::empty(table.clone())));
        Self {
            table,
            history,
            replication_state,
            lookback,
            snapshot,
        }
    }

    pub fn get_snapshot(&self) -> Arc<RepairStateSnapshot> {
        match self.snapshot.read() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replay `[now - lookback, now]` and publish a new snapshot. On error
    /// the previous snapshot stays in place.
    pub fn refresh(
        &self,
        now: DateTime<Utc>,
        repair_interval: Duration,
    ) -> Result<Arc<RepairStateSnapshot>, RepairError> {
        let topology = self.replication_state.token_range_to_replicas(&self.table);
        let nodes: BTreeSet<&Node> = topology.values().flatten().collect();

        let mut latest: HashMap<Uuid, BTreeMap<TokenRange, DateTime<Utc>>> = HashMap::new();
        for node in nodes {
            latest.insert(node.id, self.latest_successes(node, &topology, now)?);
        }

        let ranges = topology
            .into_iter()
            .map(|(range, replicas)| {
                let last_repaired_at = replicas
                    .iter()
                    .map(|n| latest.get(&n.id).and_then(|m| m.get(&range)).copied())
                    .collect::<Option<Vec<_>>>()
                    .and_then(|times| times.into_iter().min());
                VnodeRepairState {
                    range,
                    replicas,
                    last_repaired_at,
                }
            })
            .collect();
        let snapshot = Arc::new(RepairStateSnapshot::new(
            self.table.clone(),
            now,
            ranges,
            repair_interval,
        ));
        debug!(
            table = %self.table,
            ranges = snapshot.ranges.len(),
            overdue = snapshot.overdue.len(),
            "repair state refreshed"
        );
        match self.snapshot.write() {
            Ok(mut current) => *current = snapshot.clone(),
            Err(poisoned) => *poisoned.into_inner() = snapshot.clone(),
        }
        Ok(snapshot)
    }

    /// Latest successful start per range in the node's partition.
    fn latest_successes(
        &self,
        node: &Node,
        topology: &BTreeMap<TokenRange, BTreeSet<Node>>,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<TokenRange, DateTime<Utc>>, RepairError> {
        let wanted = topology
            .iter()
            .filter(|(_, replicas)| replicas.contains(node))
            .count();
        let successful = |e: &RepairEntry| e.status == RepairStatus::Success;
        let mut found = BTreeMap::new();
        for entry in self
            .history
            .iterate_node(node.id, &self.table, now, now - self.lookback, &successful)
        {
            let entry = entry?;
            if topology.contains_key(&entry.range) {
                found.entry(entry.range).or_insert(entry.started_at);
                if found.len() >= wanted {
                    break;
                }
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableReference {
        TableReference::new("ks", "tbl", Uuid::new_v4())
    }

    fn range_state(start: i64, last: Option<DateTime<Utc>>) -> VnodeRepairState {
        VnodeRepairState {
            range: TokenRange::new(start, start + 1),
            replicas: BTreeSet::new(),
            last_repaired_at: last,
        }
    }

    #[test]
    fn overdue_orders_never_first_then_oldest_then_range() {
        let now = Utc::now();
        let old = now - chrono::Duration::days(10);
        let snapshot = RepairStateSnapshot::new(
            table(),
            now,
            vec![
                range_state(30, Some(old)),
                range_state(20, Some(now)),
                range_state(10, Some(old)),
                range_state(40, None),
            ],
            Duration::from_secs(24 * 3600),
        );
        let order: Vec<i64> = snapshot.overdue().map(|r| r.range.start).collect();
        assert_eq!(order, vec![40, 10, 30]);
        assert!(!snapshot.is_overdue(&TokenRange::new(20, 21)));
        assert!((snapshot.repaired_ratio() - 0.25).abs() < f64::EPSILON);
        assert_eq!(snapshot.repaired_at(), None);
    }

    #[test]
    fn repaired_at_is_the_oldest_range() {
        let now = Utc::now();
        let older = now - chrono::Duration::hours(3);
        let snapshot = RepairStateSnapshot::new(
            table(),
            now,
            vec![range_state(1, Some(now)), range_state(2, Some(older))],
            Duration::from_secs(24 * 3600),
        );
        assert_eq!(snapshot.repaired_at(), Some(older));
        assert_eq!(snapshot.overdue().count(), 0);
        assert!((snapshot.repaired_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_snapshot_has_no_repaired_at() {
        let snapshot = RepairStateSnapshot::empty(table());
        assert_eq!(snapshot.repaired_at(), None);
        assert_eq!(snapshot.overdue().count(), 0);
    }
}
