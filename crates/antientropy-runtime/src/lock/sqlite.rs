//! SQLite-backed lock service shared by processes on one host.

#![cfg(feature = "sqlite-persistence")]

use std::sync::{Arc, Mutex, MutexGuard};

use antientropy_kernel::RepairError;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use uuid::Uuid;

use super::{LockLease, LockService};

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

#[derive(Clone)]
pub struct SqliteLockService {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLockService {
    pub fn new(db_path: &str) -> Result<Self, RepairError> {
        let conn = Connection::open(db_path)
            .map_err(|e| RepairError::Driver(format!("open sqlite lock db: {}", e)))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS repair_locks (
              resource TEXT PRIMARY KEY,
              lease_id TEXT NOT NULL,
              holder TEXT NOT NULL,
              expires_at_ms INTEGER NOT NULL,
              heartbeat_at_ms INTEGER NOT NULL,
              version INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_repair_locks_expiry ON repair_locks(expires_at_ms);
            "#,
        )
        .map_err(|e| RepairError::Driver(format!("init sqlite lock schema: {}", e)))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RepairError> {
        self.conn
            .lock()
            .map_err(|_| RepairError::Driver("sqlite lock service poisoned".to_string()))
    }
}

impl LockService for SqliteLockService {
    fn try_acquire(
        &self,
        resource: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<LockLease, RepairError> {
        let now = Utc::now();
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| RepairError::Driver(format!("begin acquire lock tx: {}", e)))?;
        let previous_version: Option<i64> = tx
            .query_row(
                "SELECT version FROM repair_locks WHERE resource = ?1 AND expires_at_ms < ?2",
                params![resource, dt_to_ms(now)],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| RepairError::Driver(format!("read expired lock: {}", e)))?;
        tx.execute(
            "DELETE FROM repair_locks WHERE resource = ?1 AND expires_at_ms < ?2",
            params![resource, dt_to_ms(now)],
        )
        .map_err(|e| RepairError::Driver(format!("cleanup expired lock: {}", e)))?;
        let lease = LockLease {
            lease_id: format!("lease-{}", Uuid::new_v4()),
            resource: resource.to_string(),
            holder: holder.to_string(),
            expires_at,
            version: previous_version.map(|v| v as u64 + 1).unwrap_or(1),
        };
        match tx.execute(
            "INSERT INTO repair_locks
             (resource, lease_id, holder, expires_at_ms, heartbeat_at_ms, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                lease.resource,
                lease.lease_id,
                lease.holder,
                dt_to_ms(expires_at),
                dt_to_ms(now),
                lease.version as i64
            ],
        ) {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                return Err(RepairError::LockBusy(format!(
                    "active lease already exists for {}",
                    resource
                )));
            }
            Err(e) => return Err(RepairError::Driver(format!("insert lock: {}", e))),
        }
        tx.commit()
            .map_err(|e| RepairError::Driver(format!("commit acquire lock tx: {}", e)))?;
        Ok(lease)
    }

    fn refresh(
        &self,
        lease: &LockLease,
        expires_at: DateTime<Utc>,
    ) -> Result<LockLease, RepairError> {
        let now = Utc::now();
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE repair_locks
                 SET expires_at_ms = ?3, heartbeat_at_ms = ?4, version = version + 1
                 WHERE resource = ?1 AND lease_id = ?2 AND expires_at_ms >= ?4",
                params![
                    lease.resource,
                    lease.lease_id,
                    dt_to_ms(expires_at),
                    dt_to_ms(now)
                ],
            )
            .map_err(|e| RepairError::Driver(format!("refresh lock: {}", e)))?;
        if updated == 0 {
            return Err(RepairError::LockBusy(format!(
                "lease on {} was lost",
                lease.resource
            )));
        }
        let (version, expires_at_ms): (i64, i64) = conn
            .query_row(
                "SELECT version, expires_at_ms FROM repair_locks WHERE resource = ?1",
                params![lease.resource],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(|e| RepairError::Driver(format!("read refreshed lock: {}", e)))?;
        Ok(LockLease {
            expires_at: ms_to_dt(expires_at_ms),
            version: version as u64,
            ..lease.clone()
        })
    }

    fn release(&self, lease: &LockLease) -> Result<(), RepairError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM repair_locks WHERE resource = ?1 AND lease_id = ?2",
            params![lease.resource, lease.lease_id],
        )
        .map_err(|e| RepairError::Driver(format!("release lock: {}", e)))?;
        Ok(())
    }

    fn expire(&self, cutoff: DateTime<Utc>) -> Result<u64, RepairError> {
        let conn = self.conn()?;
        let removed = conn
            .execute(
                "DELETE FROM repair_locks WHERE expires_at_ms < ?1",
                params![dt_to_ms(cutoff)],
            )
            .map_err(|e| RepairError::Driver(format!("expire locks: {}", e)))?;
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn temp_sqlite_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("antientropy-locks-{}-{}.db", name, Uuid::new_v4()))
    }

    #[test]
    fn two_services_on_one_file_exclude_each_other() {
        let path = temp_sqlite_path("shared");
        let path_str = path.to_string_lossy().to_string();
        let a = SqliteLockService::new(&path_str).expect("service a");
        let b = SqliteLockService::new(&path_str).expect("service b");
        let later = Utc::now() + Duration::seconds(30);

        let lease = a.try_acquire("r", "node-a", later).expect("a acquires");
        assert!(matches!(
            b.try_acquire("r", "node-b", later),
            Err(RepairError::LockBusy(_))
        ));
        let refreshed = a
            .refresh(&lease, later + Duration::seconds(30))
            .expect("refresh");
        assert_eq!(refreshed.version, lease.version + 1);

        a.release(&refreshed).expect("release");
        b.try_acquire("r", "node-b", later).expect("b acquires");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn expired_lease_is_taken_over_and_old_refresh_fails() {
        let service = SqliteLockService::new(":memory:").expect("service");
        let stale = service
            .try_acquire("r", "a", Utc::now() - Duration::seconds(1))
            .expect("acquire");
        let fresh = service
            .try_acquire("r", "b", Utc::now() + Duration::seconds(30))
            .expect("takeover");
        assert_eq!(fresh.version, 2);
        assert!(matches!(
            service.refresh(&stale, Utc::now() + Duration::seconds(30)),
            Err(RepairError::LockBusy(_))
        ));
        assert_eq!(service.expire(Utc::now()).expect("expire"), 0);
        assert_eq!(
            service
                .expire(Utc::now() + Duration::seconds(60))
                .expect("expire"),
            1
        );
    }
}
