//! SQLite-backed repair history.

#![cfg(feature = "sqlite-persistence")]

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{map_driver_err, RepairError};
use crate::timeuuid::TimeUuid;

use super::entry::{HistoryRow, RepairStatus};
use super::store::{HistoryScan, HistoryStore};

pub const SQLITE_HISTORY_SCHEMA_VERSION: i64 = 1;

const SELECT_COLUMNS: &str = "table_id, node_id, repair_id, job_id, coordinator_id, \
     range_begin, range_end, status, started_at, finished_at";

/// `repair_history` keyed `(table_id, node_id, repair_id)`. `repair_ticks`
/// repeats the timestamp embedded in `repair_id` so that scans can walk the
/// clustering order through `repair_history_clustering`.
const HISTORY_TABLE_V1: &str = r#"
    CREATE TABLE IF NOT EXISTS repair_history (
      table_id BLOB NOT NULL,
      node_id BLOB NOT NULL,
      repair_id BLOB NOT NULL,
      job_id BLOB NOT NULL,
      coordinator_id BLOB NOT NULL,
      range_begin TEXT NOT NULL,
      range_end TEXT NOT NULL,
      status TEXT NOT NULL,
      started_at TIMESTAMP NOT NULL,
      finished_at TIMESTAMP NULL,
      repair_ticks INTEGER NOT NULL,
      PRIMARY KEY (table_id, node_id, repair_id)
    );
    CREATE INDEX IF NOT EXISTS repair_history_clustering
      ON repair_history (table_id, node_id, repair_ticks DESC, repair_id DESC);
"#;

#[derive(Clone)]
pub struct SqliteHistoryStore {
    conn: Arc<Mutex<Connection>>,
}

/// Column values before the repair id is checked to be time based.
type RawRow = (
    Uuid,
    Uuid,
    Uuid,
    Uuid,
    Uuid,
    String,
    String,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

impl SqliteHistoryStore {
    pub fn new(db_path: &str) -> Result<Self, RepairError> {
        let conn = Connection::open(db_path).map_err(|e| map_driver_err("open sqlite history", e))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RepairError> {
        self.conn
            .lock()
            .map_err(|_| RepairError::Driver("sqlite history lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<(), RepairError> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS repair_history_schema_migrations (
              version INTEGER PRIMARY KEY,
              name TEXT NOT NULL,
              applied_at_ms INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| map_driver_err("init sqlite history migration table", e))?;
        let current: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM repair_history_schema_migrations",
                [],
                |r| r.get(0),
            )
            .map_err(|e| map_driver_err("read sqlite history schema version", e))?;
        if current > SQLITE_HISTORY_SCHEMA_VERSION {
            return Err(RepairError::Schema(format!(
                "sqlite history schema version {} is newer than supported {}",
                current, SQLITE_HISTORY_SCHEMA_VERSION
            )));
        }
        if current < 1 {
            conn.execute_batch(HISTORY_TABLE_V1)
                .map_err(|e| map_driver_err("apply sqlite history migration v1", e))?;
            conn.execute(
                "INSERT OR IGNORE INTO repair_history_schema_migrations(version, name, applied_at_ms)
                 VALUES (?1, ?2, ?3)",
                params![1, "baseline_repair_history", Utc::now().timestamp_millis()],
            )
            .map_err(|e| map_driver_err("record sqlite history migration", e))?;
        }
        Ok(())
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn insert(&self, row: &HistoryRow) -> Result<(), RepairError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO repair_history
             (table_id, node_id, repair_id, job_id, coordinator_id,
              range_begin, range_end, status, started_at, finished_at, repair_ticks)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                row.table_id,
                row.node_id,
                row.repair_id.as_uuid(),
                row.job_id,
                row.coordinator_id,
                row.range_begin,
                row.range_end,
                row.status.as_str(),
                row.started_at,
                row.finished_at,
                row.repair_id.ticks() as i64,
            ],
        )
        .map_err(|e| map_driver_err("insert repair history row", e))?;
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
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE repair_history SET status = ?4, finished_at = ?5
                 WHERE table_id = ?1 AND node_id = ?2 AND repair_id = ?3",
                params![
                    table_id,
                    node_id,
                    repair_id.as_uuid(),
                    status.as_str(),
                    finished_at,
                ],
            )
            .map_err(|e| map_driver_err("update repair history status", e))?;
        Ok(updated > 0)
    }

    fn get(
        &self,
        table_id: Uuid,
        node_id: Uuid,
        repair_id: &TimeUuid,
    ) -> Result<Option<HistoryRow>, RepairError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM repair_history
             WHERE table_id = ?1 AND node_id = ?2 AND repair_id = ?3"
        );
        let raw = conn
            .query_row(&sql, params![table_id, node_id, repair_id.as_uuid()], read_raw)
            .optional()
            .map_err(|e| map_driver_err("get repair history row", e))?;
        raw.map(decode_row).transpose()
    }

    fn scan_page(&self, scan: &HistoryScan) -> Result<Vec<HistoryRow>, RepairError> {
        let conn = self.conn()?;
        let upper_op = if scan.upper_inclusive { "<=" } else { "<" };
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM repair_history
             WHERE table_id = ?1 AND node_id = ?2
               AND (repair_ticks > ?3 OR (repair_ticks = ?3 AND repair_id >= ?4))
               AND (repair_ticks < ?5 OR (repair_ticks = ?5 AND repair_id {upper_op} ?6))
             ORDER BY repair_ticks DESC, repair_id DESC
             LIMIT ?7"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| map_driver_err("prepare scan repair history", e))?;
        let rows = stmt
            .query_map(
                params![
                    scan.table_id,
                    scan.node_id,
                    scan.lower.ticks() as i64,
                    scan.lower.as_uuid(),
                    scan.upper.ticks() as i64,
                    scan.upper.as_uuid(),
                    scan.limit as i64,
                ],
                read_raw,
            )
            .map_err(|e| map_driver_err("query scan repair history", e))?;
        let mut out = Vec::new();
        for raw in rows {
            let raw = raw.map_err(|e| map_driver_err("scan repair history row", e))?;
            out.push(decode_row(raw)?);
        }
        Ok(out)
    }
}

fn read_raw(row: &rusqlite::Row) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn decode_row(raw: RawRow) -> Result<HistoryRow, RepairError> {
    let (
        table_id,
        node_id,
        repair_id,
        job_id,
        coordinator_id,
        range_begin,
        range_end,
        status,
        started_at,
        finished_at,
    ) = raw;
    let repair_id = TimeUuid::from_uuid(repair_id)
        .ok_or_else(|| RepairError::Driver(format!("repair_id is not time based: {repair_id}")))?;
    Ok(HistoryRow {
        table_id,
        node_id,
        repair_id,
        job_id,
        coordinator_id,
        range_begin,
        range_end,
        status: RepairStatus::parse(&status),
        started_at,
        finished_at,
    })
}
