//! Postgres-backed repair history.
//!
//! This module is feature-gated behind `kernel-postgres`. Calls are
//! synchronous; each one is driven to completion on a dedicated
//! single-worker tokio runtime shared by every store in the process.

#![cfg(feature = "kernel-postgres")]

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::error::{map_driver_err, RepairError};
use crate::timeuuid::TimeUuid;

use super::entry::{HistoryRow, RepairStatus};
use super::store::{HistoryScan, HistoryStore};

/// Columns of `repair_history` with their `information_schema` data types.
const EXPECTED_COLUMNS: &[(&str, &str)] = &[
    ("table_id", "uuid"),
    ("node_id", "uuid"),
    ("repair_id", "uuid"),
    ("job_id", "uuid"),
    ("coordinator_id", "uuid"),
    ("range_begin", "text"),
    ("range_end", "text"),
    ("status", "text"),
    ("started_at", "timestamp with time zone"),
    ("finished_at", "timestamp with time zone"),
    ("repair_ticks", "bigint"),
];

fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn new_db_runtime() -> Result<Arc<tokio::runtime::Runtime>, String> {
    static DB_RT: OnceLock<Result<Arc<tokio::runtime::Runtime>, String>> = OnceLock::new();
    DB_RT
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(1)
                .thread_name("antientropy-history-pg")
                .build()
                .map(Arc::new)
                .map_err(|e| e.to_string())
        })
        .clone()
}

fn decode_row(row: &PgRow) -> Result<HistoryRow, RepairError> {
    let get_err = |e| map_driver_err("decode repair history row", e);
    let repair_uuid: Uuid = row.try_get("repair_id").map_err(get_err)?;
    let repair_id = TimeUuid::from_uuid(repair_uuid).ok_or_else(|| {
        RepairError::Driver(format!("repair_id is not time based: {repair_uuid}"))
    })?;
    let status: String = row.try_get("status").map_err(get_err)?;
    Ok(HistoryRow {
        table_id: row.try_get("table_id").map_err(get_err)?,
        node_id: row.try_get("node_id").map_err(get_err)?,
        repair_id,
        job_id: row.try_get("job_id").map_err(get_err)?,
        coordinator_id: row.try_get("coordinator_id").map_err(get_err)?,
        range_begin: row.try_get("range_begin").map_err(get_err)?,
        range_end: row.try_get("range_end").map_err(get_err)?,
        status: RepairStatus::parse(&status),
        started_at: row.try_get("started_at").map_err(get_err)?,
        finished_at: row.try_get("finished_at").map_err(get_err)?,
    })
}

#[derive(Clone)]
pub struct PostgresHistoryStore {
    pool: Option<PgPool>,
    schema: String,
    init_error: Option<String>,
    db_runtime: Option<Arc<tokio::runtime::Runtime>>,
    /// Bootstrap outcome once it is final: ready, or a schema that cannot be used.
    schema_ready: OnceLock<Result<(), RepairError>>,
}

impl PostgresHistoryStore {
    pub fn new(database_url: impl Into<String>) -> Self {
        let database_url = database_url.into();
        let db_runtime = new_db_runtime().ok();
        // The pool spawns its maintenance tasks on the runtime it is created in.
        let pool = {
            let _enter = db_runtime.as_ref().map(|rt| rt.enter());
            PgPoolOptions::new()
                .max_connections(5)
                .connect_lazy(&database_url)
                .ok()
        };
        let init_error = if pool.is_some() {
            None
        } else {
            Some("failed to initialize lazy postgres history pool".to_string())
        };

        Self {
            pool,
            schema: "public".to_string(),
            init_error,
            db_runtime,
            schema_ready: OnceLock::new(),
        }
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool: Some(pool),
            schema: "public".to_string(),
            init_error: None,
            db_runtime: new_db_runtime().ok(),
            schema_ready: OnceLock::new(),
        }
    }

    /// Place the history table in `schema`, the Postgres counterpart of a keyspace.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    fn runtime(&self) -> Result<&tokio::runtime::Runtime, RepairError> {
        if let Some(err) = &self.init_error {
            return Err(map_driver_err("postgres init error", err));
        }
        self.db_runtime
            .as_deref()
            .ok_or_else(|| map_driver_err("runtime not available", "no db runtime"))
    }

    fn pool(&self) -> Result<&PgPool, RepairError> {
        self.pool
            .as_ref()
            .ok_or_else(|| map_driver_err("pool not available", "no postgres pool"))
    }

    /// Create the history table if absent and verify an existing one has the
    /// expected columns. A table missing columns, or holding them with other
    /// types, yields [`RepairError::Schema`].
    ///
    /// Success and schema errors are remembered; a driver error is not, so
    /// the next call retries once the database is reachable again.
    pub fn ensure_schema(&self) -> Result<(), RepairError> {
        if !is_valid_schema_ident(&self.schema) {
            return Err(RepairError::Schema(format!(
                "invalid schema name: {}",
                self.schema
            )));
        }
        if let Some(outcome) = self.schema_ready.get() {
            return outcome.clone();
        }
        let outcome = self.bootstrap_schema();
        match &outcome {
            Err(e) if e.is_transient() => {}
            _ => {
                let _ = self.schema_ready.set(outcome.clone());
            }
        }
        outcome
    }

    fn bootstrap_schema(&self) -> Result<(), RepairError> {
        let schema = self.schema.clone();
        let sql_schema = format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema);
        let sql_history = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\".repair_history (
                table_id UUID NOT NULL,
                node_id UUID NOT NULL,
                repair_id UUID NOT NULL,
                job_id UUID NOT NULL,
                coordinator_id UUID NOT NULL,
                range_begin TEXT NOT NULL,
                range_end TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ NULL,
                repair_ticks BIGINT NOT NULL,
                PRIMARY KEY (table_id, node_id, repair_id)
            )",
            schema
        );
        // Clustering order: newest repair id first within a partition.
        let sql_index = format!(
            "CREATE INDEX IF NOT EXISTS repair_history_clustering
             ON \"{}\".repair_history (table_id, node_id, repair_ticks DESC, repair_id DESC)",
            schema
        );
        let sql_columns = "SELECT column_name, data_type FROM information_schema.columns
             WHERE table_schema = $1 AND table_name = 'repair_history'";

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let columns: Vec<(String, String)> = rt
            .block_on(async {
                sqlx::query(&sql_schema).execute(&pool).await?;
                sqlx::query(&sql_history).execute(&pool).await?;
                sqlx::query(&sql_index).execute(&pool).await?;
                let rows = sqlx::query(sql_columns)
                    .bind(&schema)
                    .fetch_all(&pool)
                    .await?;
                rows.iter()
                    .map(|r| Ok((r.try_get::<String, _>(0)?, r.try_get::<String, _>(1)?)))
                    .collect::<Result<Vec<_>, sqlx::Error>>()
            })
            .map_err(|e| map_driver_err("schema bootstrap", e))?;

        let mismatched: Vec<String> = EXPECTED_COLUMNS
            .iter()
            .filter_map(|(name, ty)| {
                match columns.iter().find(|(have, _)| have == name) {
                    None => Some(format!("{name} (missing)")),
                    Some((_, have_ty)) if have_ty != ty => {
                        Some(format!("{name} ({have_ty}, expected {ty})"))
                    }
                    Some(_) => None,
                }
            })
            .collect();
        if !mismatched.is_empty() {
            return Err(RepairError::Schema(format!(
                "\"{}\".repair_history does not match the history layout: {}",
                schema,
                mismatched.join(", ")
            )));
        }
        Ok(())
    }
}

impl HistoryStore for PostgresHistoryStore {
    fn insert(&self, row: &HistoryRow) -> Result<(), RepairError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "INSERT INTO \"{}\".repair_history
             (table_id, node_id, repair_id, job_id, coordinator_id,
              range_begin, range_end, status, started_at, finished_at, repair_ticks)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            self.schema
        );
        rt.block_on(async move {
            sqlx::query(&sql)
                .bind(row.table_id)
                .bind(row.node_id)
                .bind(*row.repair_id.as_uuid())
                .bind(row.job_id)
                .bind(row.coordinator_id)
                .bind(&row.range_begin)
                .bind(&row.range_end)
                .bind(row.status.as_str())
                .bind(row.started_at)
                .bind(row.finished_at)
                .bind(row.repair_id.ticks() as i64)
                .execute(&pool)
                .await
                .map_err(|e| map_driver_err("insert repair history row", e))?;
            Ok(())
        })
    }

    fn update_status(
        &self,
        table_id: Uuid,
        node_id: Uuid,
        repair_id: &TimeUuid,
        status: RepairStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<bool, RepairError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "UPDATE \"{}\".repair_history SET status = $4, finished_at = $5
             WHERE table_id = $1 AND node_id = $2 AND repair_id = $3",
            self.schema
        );
        let repair_uuid = *repair_id.as_uuid();
        rt.block_on(async move {
            let result = sqlx::query(&sql)
                .bind(table_id)
                .bind(node_id)
                .bind(repair_uuid)
                .bind(status.as_str())
                .bind(finished_at)
                .execute(&pool)
                .await
                .map_err(|e| map_driver_err("update repair history status", e))?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn get(
        &self,
        table_id: Uuid,
        node_id: Uuid,
        repair_id: &TimeUuid,
    ) -> Result<Option<HistoryRow>, RepairError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let sql = format!(
            "SELECT * FROM \"{}\".repair_history
             WHERE table_id = $1 AND node_id = $2 AND repair_id = $3",
            self.schema
        );
        let repair_uuid = *repair_id.as_uuid();
        rt.block_on(async move {
            let row = sqlx::query(&sql)
                .bind(table_id)
                .bind(node_id)
                .bind(repair_uuid)
                .fetch_optional(&pool)
                .await
                .map_err(|e| map_driver_err("get repair history row", e))?;
            row.as_ref().map(decode_row).transpose()
        })
    }

    fn scan_page(&self, scan: &HistoryScan) -> Result<Vec<HistoryRow>, RepairError> {
        self.ensure_schema()?;

        let pool = self.pool()?.clone();
        let rt = self.runtime()?;
        let upper_op = if scan.upper_inclusive { "<=" } else { "<" };
        let sql = format!(
            "SELECT * FROM \"{}\".repair_history
             WHERE table_id = $1 AND node_id = $2
               AND (repair_ticks, repair_id) >= ($3, $4)
               AND (repair_ticks, repair_id) {} ($5, $6)
             ORDER BY repair_ticks DESC, repair_id DESC
             LIMIT $7",
            self.schema, upper_op
        );
        let scan = scan.clone();
        rt.block_on(async move {
            let rows = sqlx::query(&sql)
                .bind(scan.table_id)
                .bind(scan.node_id)
                .bind(scan.lower.ticks() as i64)
                .bind(*scan.lower.as_uuid())
                .bind(scan.upper.ticks() as i64)
                .bind(*scan.upper.as_uuid())
                .bind(scan.limit as i64)
                .fetch_all(&pool)
                .await
                .map_err(|e| map_driver_err("scan repair history", e))?;
            rows.iter().map(decode_row).collect()
        })
    }

    fn verify_schema(&self) -> Result<(), RepairError> {
        self.ensure_schema()
    }
}
