//! In-memory repair history, for tests and single-process embedding.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::RepairError;
use crate::timeuuid::TimeUuid;

use super::entry::{HistoryRow, RepairStatus};
use super::store::{HistoryScan, HistoryStore};

type Partition = BTreeMap<TimeUuid, HistoryRow>;

#[derive(Default)]
pub struct InMemoryHistoryStore {
    partitions: Mutex<HashMap<(Uuid, Uuid), Partition>>,
    unavailable: AtomicBool,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails with [RepairError::Driver] as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of rows across all partitions.
    pub fn len(&self) -> usize {
        self.partitions
            .lock()
            .map(|p| p.values().map(|rows| rows.len()).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self, op: &str) -> Result<(), RepairError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepairError::Driver(format!("{op}: history store unavailable")));
        }
        Ok(())
    }

    fn partitions(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(Uuid, Uuid), Partition>>, RepairError> {
        self.partitions
            .lock()
            .map_err(|_| RepairError::Driver("in-memory history lock poisoned".to_string()))
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn insert(&self, row: &HistoryRow) -> Result<(), RepairError> {
        self.check_available("insert repair history row")?;
        self.partitions()?
            .entry((row.table_id, row.node_id))
            .or_default()
            .insert(row.repair_id, row.clone());
        Ok(())
    }

    fn update_status(
        &self,
        table_id: Uuid,
        node_id: Uuid,
        repair_id: &TimeUuid,
        status: RepairStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, RepairError> {
        self.check_available("update repair history status")?;
        let mut partitions = self.partitions()?;
        let Some(row) = partitions
            .get_mut(&(table_id, node_id))
            .and_then(|p| p.get_mut(repair_id))
        else {
            return Ok(false);
        };
        row.status = status;
        row.finished_at = Some(finished_at);
        Ok(true)
    }

    fn get(
        &self,
        table_id: Uuid,
        node_id: Uuid,
        repair_id: &TimeUuid,
    ) -> Result<Option<HistoryRow>, RepairError> {
        self.check_available("get repair history row")?;
        Ok(self
            .partitions()?
            .get(&(table_id, node_id))
            .and_then(|p| p.get(repair_id))
            .cloned())
    }

    fn scan_page(&self, scan: &HistoryScan) -> Result<Vec<HistoryRow>, RepairError> {
        self.check_available("scan repair history")?;
        if scan.lower > scan.upper {
            return Ok(Vec::new());
        }
        let partitions = self.partitions()?;
        let Some(partition) = partitions.get(&(scan.table_id, scan.node_id)) else {
            return Ok(Vec::new());
        };
        Ok(partition
            .range(scan.lower..=scan.upper)
            .rev()
            .filter(|(id, _)| scan.admits(id))
            .take(scan.limit)
            .map(|(_, row)| row.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(table_id: Uuid, node_id: Uuid, repair_id: TimeUuid) -> HistoryRow {
        HistoryRow {
            table_id,
            node_id,
            repair_id,
            job_id: Uuid::new_v4(),
            coordinator_id: node_id,
            range_begin: "1".into(),
            range_end: "2".into(),
            status: RepairStatus::Started,
            started_at: repair_id.timestamp(),
            finished_at: None,
        }
    }

    #[test]
    fn scan_pages_descend_and_respect_exclusive_upper() {
        let store = InMemoryHistoryStore::new();
        let (table_id, node_id) = (Uuid::new_v4(), Uuid::new_v4());
        let ids: Vec<TimeUuid> = (0..5)
            .map(|i| TimeUuid::from_unix_millis(1_000_000 + i))
            .collect();
        for id in &ids {
            store.insert(&row(table_id, node_id, *id)).unwrap();
        }

        let mut scan = HistoryScan {
            table_id,
            node_id,
            lower: TimeUuid::min_for_millis(1_000_001),
            upper: TimeUuid::max_for_millis(1_000_004),
            upper_inclusive: true,
            limit: 2,
        };
        let first = store.scan_page(&scan).unwrap();
        assert_eq!(
            first.iter().map(|r| r.repair_id).collect::<Vec<_>>(),
            vec![ids[4], ids[3]]
        );

        scan.upper = ids[3];
        scan.upper_inclusive = false;
        let second = store.scan_page(&scan).unwrap();
        assert_eq!(
            second.iter().map(|r| r.repair_id).collect::<Vec<_>>(),
            vec![ids[2], ids[1]]
        );
    }

    #[test]
    fn update_of_missing_row_reports_false() {
        let store = InMemoryHistoryStore::new();
        let updated = store
            .update_status(
                Uuid::new_v4(),
                Uuid::new_v4(),
                &TimeUuid::now(),
                RepairStatus::Success,
                Utc::now(),
            )
            .unwrap();
        assert!(!updated);
        assert!(store.is_empty());
    }

    #[test]
    fn unavailable_store_fails_with_driver_error() {
        let store = InMemoryHistoryStore::new();
        store.set_unavailable(true);
        let err = store
            .insert(&row(Uuid::new_v4(), Uuid::new_v4(), TimeUuid::now()))
            .unwrap_err();
        assert!(matches!(err, RepairError::Driver(_)));
        store.set_unavailable(false);
        assert!(store
            .insert(&row(Uuid::new_v4(), Uuid::new_v4(), TimeUuid::now()))
            .is_ok());
    }
}
