//! Replica-partitioned repair history: opens sessions and reads progress back.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RepairError;
use crate::identity::{Node, TableReference};
use crate::timeuuid::TimeUuid;
use crate::token::TokenRange;
use crate::topology::ReplicationState;

use super::entry::{HistoryRow, RepairEntry};
use super::session::{ActiveRepairSession, RepairSession};
use super::store::{HistoryScan, HistoryStore};

pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Predicate applied lazily to every entry of an iteration.
pub type EntryPredicate<'a> = &'a dyn Fn(&RepairEntry) -> bool;

/// Lazily evaluated entries; a store error ends the sequence.
pub type RepairEntries<'a> = Box<dyn Iterator<Item = Result<RepairEntry, RepairError>> + 'a>;

/// Read side of the repair history.
pub trait RepairHistoryProvider: Send + Sync {
    /// Entries of the local node with `started_at` in `[from, to]`, newest first.
    fn iterate<'a>(
        &'a self,
        table: &TableReference,
        to: DateTime<Utc>,
        from: DateTime<Utc>,
        predicate: EntryPredicate<'a>,
    ) -> RepairEntries<'a>;

    /// Entries of any replica `node_id` with `started_at` in `[from, to]`, newest first.
    fn iterate_node<'a>(
        &'a self,
        node_id: Uuid,
        table: &TableReference,
        to: DateTime<Utc>,
        from: DateTime<Utc>,
        predicate: EntryPredicate<'a>,
    ) -> RepairEntries<'a>;
}

pub struct RepairHistory {
    local_node: Node,
    store: Arc<dyn HistoryStore>,
    replication_state: Arc<dyn ReplicationState>,
    lookback: Duration,
    page_size: usize,
}

impl RepairHistory {
    pub fn builder() -> RepairHistoryBuilder {
        RepairHistoryBuilder::default()
    }

    pub fn local_node(&self) -> &Node {
        &self.local_node
    }

    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    /// Opens a session for `range`.
    ///
    /// Returns [RepairSession::NoOp] unless `participants` is exactly the
    /// replica set the topology reports for the range.
    pub fn new_session(
        &self,
        table: &TableReference,
        job_id: Uuid,
        range: TokenRange,
        participants: &BTreeSet<Node>,
    ) -> RepairSession {
        let replicas = self.replication_state.replicas_for(table, &range);
        if replicas.is_empty() || &replicas != participants {
            debug!(
                table = %table,
                range = %range,
                participants = participants.len(),
                replicas = replicas.len(),
                "participants do not match topology, using no-op repair session"
            );
            return RepairSession::NoOp;
        }
        RepairSession::Active(ActiveRepairSession::new(
            self.store.clone(),
            table.clone(),
            job_id,
            self.local_node.id,
            range,
            replicas,
        ))
    }

    fn clamp_from(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from.max(Utc::now() - self.lookback)
    }

    fn entries<'a>(
        &'a self,
        node_id: Uuid,
        cluster_wide: bool,
        table: &TableReference,
        to: DateTime<Utc>,
        from: DateTime<Utc>,
        predicate: EntryPredicate<'a>,
    ) -> RepairEntryIter<'a> {
        let from = self.clamp_from(from);
        RepairEntryIter {
            store: self.store.as_ref(),
            replication_state: self.replication_state.as_ref(),
            cluster_wide,
            table: table.clone(),
            scan: HistoryScan {
                table_id: table.id,
                node_id,
                lower: TimeUuid::min_for_millis(from.timestamp_millis()),
                upper: TimeUuid::max_for_millis(to.timestamp_millis()),
                upper_inclusive: true,
                limit: self.page_size,
            },
            exhausted: from > to,
            buffered: VecDeque::new(),
            replicas: None,
            predicate,
        }
    }
}

impl RepairHistoryProvider for RepairHistory {
    fn iterate<'a>(
        &'a self,
        table: &TableReference,
        to: DateTime<Utc>,
        from: DateTime<Utc>,
        predicate: EntryPredicate<'a>,
    ) -> RepairEntries<'a> {
        Box::new(self.entries(self.local_node.id, false, table, to, from, predicate))
    }

    fn iterate_node<'a>(
        &'a self,
        node_id: Uuid,
        table: &TableReference,
        to: DateTime<Utc>,
        from: DateTime<Utc>,
        predicate: EntryPredicate<'a>,
    ) -> RepairEntries<'a> {
        Box::new(self.entries(node_id, true, table, to, from, predicate))
    }
}

#[derive(Default)]
pub struct RepairHistoryBuilder {
    local_node: Option<Node>,
    store: Option<Arc<dyn HistoryStore>>,
    replication_state: Option<Arc<dyn ReplicationState>>,
    lookback: Option<std::time::Duration>,
    page_size: Option<usize>,
}

impl RepairHistoryBuilder {
    pub fn with_local_node(mut self, node: Node) -> Self {
        self.local_node = Some(node);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_replication_state(mut self, state: Arc<dyn ReplicationState>) -> Self {
        self.replication_state = Some(state);
        self
    }

    /// Retention horizon; reads never reach further back than this.
    pub fn with_lookback(mut self, lookback: std::time::Duration) -> Self {
        self.lookback = Some(lookback);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn build(self) -> Result<RepairHistory, RepairError> {
        let local_node = self
            .local_node
            .ok_or_else(|| RepairError::Config("repair history requires a local node".into()))?;
        let store = self
            .store
            .ok_or_else(|| RepairError::Config("repair history requires a store".into()))?;
        let replication_state = self.replication_state.ok_or_else(|| {
            RepairError::Config("repair history requires a replication state".into())
        })?;
        let lookback = match self.lookback {
            Some(lookback) => Duration::from_std(lookback)
                .map_err(|e| RepairError::Config(format!("invalid lookback: {e}")))?,
            None => Duration::days(DEFAULT_LOOKBACK_DAYS),
        };
        let page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 {
            return Err(RepairError::Config("history page size must be positive".into()));
        }
        Ok(RepairHistory {
            local_node,
            store,
            replication_state,
            lookback,
            page_size,
        })
    }
}

/// Lazy, page-at-a-time iteration over one history partition.
///
/// Yields entries in strictly descending `repair_id` order. A store error
/// is yielded once and ends the iteration.
pub struct RepairEntryIter<'a> {
    store: &'a dyn HistoryStore,
    replication_state: &'a dyn ReplicationState,
    cluster_wide: bool,
    table: TableReference,
    scan: HistoryScan,
    exhausted: bool,
    buffered: VecDeque<HistoryRow>,
    replicas: Option<BTreeMap<TokenRange, BTreeSet<Node>>>,
    predicate: EntryPredicate<'a>,
}

impl RepairEntryIter<'_> {
    fn fill(&mut self) -> Result<(), RepairError> {
        let page = self.store.scan_page(&self.scan)?;
        if page.len() < self.scan.limit {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.scan.upper = last.repair_id;
            self.scan.upper_inclusive = false;
        }
        self.buffered.extend(page);
        Ok(())
    }

    fn to_entry(&mut self, row: HistoryRow) -> Option<RepairEntry> {
        let Some(range) = row.range() else {
            warn!(
                table = %self.table,
                repair_id = %row.repair_id,
                range_begin = %row.range_begin,
                range_end = %row.range_end,
                "skipping history row with unparsable range"
            );
            return None;
        };
        if self.replicas.is_none() {
            let replicas = if self.cluster_wide {
                self.replication_state
                    .cluster_wide_token_range_to_replicas(&self.table)
            } else {
                self.replication_state.token_range_to_replicas(&self.table)
            };
            self.replicas = Some(replicas);
        }
        let participants = self
            .replicas
            .as_ref()
            .and_then(|replicas| replicas.get(&range))
            .cloned()
            .unwrap_or_default();
        Some(RepairEntry {
            repair_id: row.repair_id,
            job_id: row.job_id,
            coordinator_id: row.coordinator_id,
            range,
            participants,
            status: row.status,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

impl Iterator for RepairEntryIter<'_> {
    type Item = Result<RepairEntry, RepairError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.buffered.pop_front() {
                match self.to_entry(row) {
                    Some(entry) if (self.predicate)(&entry) => return Some(Ok(entry)),
                    _ => continue,
                }
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}
