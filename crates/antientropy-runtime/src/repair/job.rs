//! Per-table repair driver.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use antientropy_kernel::{
    Node, RepairError, RepairHistory, RepairStatus, ReplicationState, TableReference, TokenRange,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{RepairConfiguration, RepairLockType};
use crate::fault::{FaultCode, RepairFaultReporter};
use crate::lock::{LockFence, LockScope};
use crate::metrics::TableRepairMetrics;
use crate::policy::{all_allow, RepairPolicy};
use crate::rpc::RepairRpc;
use crate::scheduling::{BusyReplicas, ScheduledJob, ScheduledTask};

use super::state::{RepairState, RepairStateSnapshot, VnodeRepairState};

/// Collaborators shared by every job of one scheduler.
pub struct RepairJobContext {
    pub history: Arc<RepairHistory>,
    pub replication_state: Arc<dyn ReplicationState>,
    pub rpc: Arc<dyn RepairRpc>,
    pub metrics: Arc<dyn TableRepairMetrics>,
    pub fault_reporter: Arc<dyn RepairFaultReporter>,
    pub policies: Vec<Arc<dyn RepairPolicy>>,
    pub lock_type: RepairLockType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Every range was repaired within the interval.
    Completed,
    OnTime,
    /// Past the warning time.
    Late,
    /// Past the error time.
    Overdue,
    /// Ranges are due but every one is vetoed by a policy.
    Blocked,
}

/// Point-in-time description of a job for listings.
#[derive(Clone, Debug, Serialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub table: TableReference,
    pub status: JobStatus,
    /// Share of ranges repaired within the interval.
    pub progress: f64,
    pub last_repaired_at: Option<DateTime<Utc>>,
    pub next_repair_at: DateTime<Utc>,
    pub running_tasks: usize,
    pub config: RepairConfiguration,
}

#[derive(Clone, Copy, Debug)]
struct RangeFailure {
    count: u32,
    retry_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct JobProgress {
    in_flight: BTreeSet<TokenRange>,
    /// Successes not yet visible in the snapshot, with their wall-clock time.
    completed: HashMap<TokenRange, DateTime<Utc>>,
    failures: HashMap<TokenRange, RangeFailure>,
    consecutive_failures: u32,
    failure_fault_raised: bool,
    age_fault: Option<FaultCode>,
    paused_until: Option<DateTime<Utc>>,
}

struct JobInner {
    id: Uuid,
    table: TableReference,
    created_at: DateTime<Utc>,
    config: RwLock<RepairConfiguration>,
    state: RepairState,
    ctx: Arc<RepairJobContext>,
    progress: Mutex<JobProgress>,
    cancelled: AtomicBool,
}

/// Repairs every locally replicated range of one table, oldest first.
pub struct TableRepairJob {
    inner: Arc<JobInner>,
}

impl TableRepairJob {
    pub fn new(
        table: TableReference,
        config: RepairConfiguration,
        ctx: Arc<RepairJobContext>,
    ) -> Result<Self, RepairError> {
        config.validate()?;
        let state = RepairState::new(
            table.clone(),
            ctx.history.clone(),
            ctx.replication_state.clone(),
            ctx.history.lookback(),
        );
        Ok(Self {
            inner: Arc::new(JobInner {
                id: Uuid::new_v4(),
                table,
                created_at: Utc::now(),
                config: RwLock::new(config),
                state,
                ctx,
                progress: Mutex::new(JobProgress::default()),
                cancelled: AtomicBool::new(false),
            }),
        })
    }

    pub fn table(&self) -> &TableReference {
        &self.inner.table
    }

    pub fn configuration(&self) -> RepairConfiguration {
        self.inner.config()
    }

    /// Takes effect from the next tick; running tasks are unaffected.
    pub fn update_configuration(&self, config: RepairConfiguration) -> Result<(), RepairError> {
        config.validate()?;
        match self.inner.config.write() {
            Ok(mut current) => *current = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        Ok(())
    }

    /// Stop handing out tasks and clear any alarms this job raised.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let raised = match self.inner.progress() {
            Ok(mut progress) => {
                let mut raised = Vec::new();
                if progress.failure_fault_raised {
                    progress.failure_fault_raised = false;
                    raised.push(FaultCode::RepairFailure);
                }
                raised.extend(progress.age_fault.take());
                raised
            }
            Err(_) => Vec::new(),
        };
        for code in raised {
            self.inner.ctx.fault_reporter.cease(code, &self.inner.table);
        }
        info!(table = %self.inner.table, job_id = %self.inner.id, "repair job cancelled");
    }

    pub fn snapshot(&self) -> Arc<RepairStateSnapshot> {
        self.inner.state.get_snapshot()
    }

    pub fn view(&self, now: DateTime<Utc>) -> JobView {
        let inner = &self.inner;
        let config = inner.config();
        let snapshot = inner.state.get_snapshot();
        let running_tasks = inner.progress().map(|p| p.in_flight.len()).unwrap_or(0);
        let last_repaired_at = snapshot.repaired_at();

        let due: Vec<&VnodeRepairState> = snapshot.overdue().collect();
        let status = if due.is_empty() {
            JobStatus::Completed
        } else if due
            .iter()
            .all(|r| !all_allow(&inner.ctx.policies, &inner.table, &r.range))
        {
            JobStatus::Blocked
        } else {
            match inner.age_fault(&snapshot, now, &config) {
                Some(FaultCode::RepairError) => JobStatus::Overdue,
                Some(_) => JobStatus::Late,
                None => JobStatus::OnTime,
            }
        };
        let next_repair_at = match (last_repaired_at, due.is_empty()) {
            (Some(at), _) => later(at, config.repair_interval),
            (None, true) => later(now, config.repair_interval),
            (None, false) => now,
        };
        JobView {
            job_id: inner.id,
            table: inner.table.clone(),
            status,
            progress: snapshot.repaired_ratio(),
            last_repaired_at,
            next_repair_at,
            running_tasks,
            config,
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// `at + duration`, saturating at the end of representable time.
fn later(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_chrono(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl JobInner {
    fn config(&self) -> RepairConfiguration {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn progress(&self) -> Result<MutexGuard<'_, JobProgress>, RepairError> {
        self.progress
            .lock()
            .map_err(|_| RepairError::Driver("repair job progress poisoned".to_string()))
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn lookback_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.ctx.history.lookback())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Age alarm due for the snapshot. A never-repaired table counts from
    /// registration, bounded by the lookback window.
    fn age_fault(
        &self,
        snapshot: &RepairStateSnapshot,
        now: DateTime<Utc>,
        config: &RepairConfiguration,
    ) -> Option<FaultCode> {
        if snapshot.ranges.is_empty() {
            return None;
        }
        let repaired_at = snapshot
            .repaired_at()
            .unwrap_or_else(|| self.created_at.max(self.lookback_start(now)));
        let age = now.signed_duration_since(repaired_at);
        if age > to_chrono(config.repair_error_time) {
            Some(FaultCode::RepairError)
        } else if age > to_chrono(config.repair_warning_time) {
            Some(FaultCode::RepairWarning)
        } else {
            None
        }
    }

    /// Overdue ranges that may be handed out now, most overdue first.
    fn candidates<'a>(
        &self,
        snapshot: &'a RepairStateSnapshot,
        progress: &JobProgress,
        now: DateTime<Utc>,
    ) -> Vec<&'a VnodeRepairState> {
        snapshot
            .overdue()
            .filter(|r| !r.replicas.is_empty())
            .filter(|r| !progress.in_flight.contains(&r.range))
            .filter(|r| !progress.completed.contains_key(&r.range))
            .filter(|r| {
                progress
                    .failures
                    .get(&r.range)
                    .map_or(true, |f| f.retry_at <= now)
            })
            .filter(|r| all_allow(&self.ctx.policies, &self.table, &r.range))
            .collect()
    }

    fn is_paused(progress: &JobProgress, now: DateTime<Utc>) -> bool {
        progress.paused_until.is_some_and(|until| until > now)
    }

    fn record_success(&self, range: &TokenRange, elapsed: Duration, config: &RepairConfiguration) {
        let now = Utc::now();
        let cease = match self.progress() {
            Ok(mut progress) => {
                progress.failures.remove(range);
                progress.completed.insert(*range, now);
                progress.consecutive_failures = 0;
                if config.unwind_ratio > 0.0 {
                    let pause = Duration::try_from_secs_f64(elapsed.as_secs_f64() * config.unwind_ratio)
                        .unwrap_or(config.repair_interval);
                    progress.paused_until = Some(later(now, pause));
                }
                std::mem::take(&mut progress.failure_fault_raised)
            }
            Err(_) => false,
        };
        if cease {
            self.ctx
                .fault_reporter
                .cease(FaultCode::RepairFailure, &self.table);
        }
    }

    fn record_failure(&self, range: &TokenRange, config: &RepairConfiguration, reason: &str) {
        let now = Utc::now();
        let raise = match self.progress() {
            Ok(mut progress) => {
                let count = progress.failures.get(range).map_or(0, |f| f.count) + 1;
                let delay = backoff_delay(config, count);
                progress.failures.insert(
                    *range,
                    RangeFailure {
                        count,
                        retry_at: later(now, delay),
                    },
                );
                progress.consecutive_failures += 1;
                debug!(
                    table = %self.table,
                    range = %range,
                    failures = count,
                    retry_in_ms = delay.as_millis() as u64,
                    "range repair failed, backing off"
                );
                if progress.consecutive_failures >= config.failure_fault_threshold
                    && !progress.failure_fault_raised
                {
                    progress.failure_fault_raised = true;
                    Some(progress.consecutive_failures)
                } else {
                    None
                }
            }
            Err(_) => None,
        };
        if let Some(failures) = raise {
            self.ctx.fault_reporter.raise(
                FaultCode::RepairFailure,
                &self.table,
                &format!("{failures} consecutive repair failures, last: {reason}"),
            );
        }
    }
}

/// `backoff_initial * 2^(failures - 1)`, capped at the repair interval.
fn backoff_delay(config: &RepairConfiguration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    config
        .backoff_initial
        .saturating_mul(1u32 << exp)
        .min(config.repair_interval)
}

impl ScheduledJob for TableRepairJob {
    fn id(&self) -> Uuid {
        self.inner.id
    }

    fn refresh(&self, now: DateTime<Utc>) -> Result<(), RepairError> {
        let inner = &self.inner;
        let config = inner.config();
        let started = Utc::now();
        let snapshot = inner.state.refresh(now, config.repair_interval)?;
        if let Ok(mut progress) = inner.progress() {
            progress.completed.retain(|_, at| *at >= started);
        }
        if let Some(repaired_at) = snapshot.repaired_at() {
            inner.ctx.metrics.last_repaired_at(&inner.table, repaired_at);
        }

        let wanted = inner.age_fault(&snapshot, now, &config);
        let previous = match inner.progress() {
            Ok(mut progress) => std::mem::replace(&mut progress.age_fault, wanted),
            Err(_) => return Ok(()),
        };
        if previous != wanted {
            if let Some(code) = previous {
                inner.ctx.fault_reporter.cease(code, &inner.table);
            }
            if let Some(code) = wanted {
                let detail = match snapshot.repaired_at() {
                    Some(at) => format!("last fully repaired at {at}"),
                    None => "never fully repaired".to_string(),
                };
                inner.ctx.fault_reporter.raise(code, &inner.table, &detail);
            }
        }
        Ok(())
    }

    /// `priority × (steps of priority_granularity the most overdue range is past its interval + 1)`.
    fn priority(&self, now: DateTime<Utc>) -> i64 {
        let inner = &self.inner;
        if inner.is_cancelled() {
            return 0;
        }
        let config = inner.config();
        let snapshot = inner.state.get_snapshot();
        let Ok(progress) = inner.progress() else {
            return 0;
        };
        if JobInner::is_paused(&progress, now) {
            return 0;
        }
        let Some(oldest) = inner.candidates(&snapshot, &progress, now).first().copied() else {
            return 0;
        };
        let last = oldest
            .last_repaired_at
            .unwrap_or_else(|| inner.lookback_start(now));
        let due = later(last, config.repair_interval);
        let past_due = now.signed_duration_since(due).max(chrono::Duration::zero());
        let granularity = to_chrono(config.priority_granularity).num_milliseconds().max(1);
        let steps = past_due.num_milliseconds() / granularity + 1;
        config.priority.saturating_mul(steps)
    }

    fn next_task(
        &self,
        now: DateTime<Utc>,
        busy: &BusyReplicas,
    ) -> Option<Box<dyn ScheduledTask>> {
        let inner = &self.inner;
        if inner.is_cancelled() {
            return None;
        }
        let config = inner.config();
        let snapshot = inner.state.get_snapshot();
        let mut progress = inner.progress().ok()?;
        if JobInner::is_paused(&progress, now) || progress.in_flight.len() >= config.parallelism {
            return None;
        }
        let chosen = inner
            .candidates(&snapshot, &progress, now)
            .into_iter()
            .find(|r| !busy.overlaps(&r.replicas))?;
        let range = chosen.range;
        let replicas = chosen.replicas.clone();
        progress.in_flight.insert(range);
        drop(progress);

        Some(Box::new(RepairTask {
            job: inner.clone(),
            lock_scopes: LockScope::for_replicas(inner.ctx.lock_type, &replicas),
            range,
            replicas,
        }))
    }

    fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }
}

/// Repair of one range; returns its range to the job when dropped.
pub struct RepairTask {
    job: Arc<JobInner>,
    range: TokenRange,
    replicas: BTreeSet<Node>,
    lock_scopes: Vec<LockScope>,
}

impl RepairTask {
    pub fn range(&self) -> &TokenRange {
        &self.range
    }
}

impl ScheduledTask for RepairTask {
    fn replicas(&self) -> &BTreeSet<Node> {
        &self.replicas
    }

    fn lock_scopes(&self) -> Vec<LockScope> {
        self.lock_scopes.clone()
    }

    fn execute(self: Box<Self>, fence: &LockFence) -> Result<(), RepairError> {
        let job = &self.job;
        let table = &job.table;
        let config = job.config();
        let started = Instant::now();

        let mut session = job
            .ctx
            .history
            .new_session(table, job.id, self.range, &self.replicas);
        if session.is_noop() {
            debug!(table = %table, range = %self.range, "range left the topology, skipping");
            return Ok(());
        }
        if let Err(e) = session.start().and_then(|()| fence.check()) {
            warn!(table = %table, range = %self.range, error = %e, "repair not started");
            if let Err(finish_err) = session.finish(RepairStatus::Failed) {
                debug!(
                    table = %table,
                    range = %self.range,
                    error = %finish_err,
                    "best-effort finish after failed start"
                );
            }
            job.record_failure(&self.range, &config, &e.to_string());
            return Err(e);
        }

        // A repair that outlived its locks may have overlapped another one.
        let result = job
            .ctx
            .rpc
            .run_repair(table, &self.range, &self.replicas)
            .and_then(|()| fence.check());
        let status = if result.is_ok() {
            RepairStatus::Success
        } else {
            RepairStatus::Failed
        };
        if let Err(e) = session.finish(status) {
            warn!(
                table = %table,
                range = %self.range,
                status = %status,
                error = %e,
                "could not record repair finish"
            );
        }

        let elapsed = started.elapsed();
        let success = result.is_ok();
        job.ctx
            .metrics
            .repair_session(table, &self.range, elapsed, success);
        match result {
            Ok(()) => {
                info!(
                    table = %table,
                    range = %self.range,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "range repaired"
                );
                job.record_success(&self.range, elapsed, &config);
                Ok(())
            }
            Err(e) => {
                warn!(table = %table, range = %self.range, error = %e, "range repair failed");
                job.record_failure(&self.range, &config, &e.to_string());
                Err(e)
            }
        }
    }
}

impl Drop for RepairTask {
    fn drop(&mut self) {
        if let Ok(mut progress) = self.job.progress() {
            progress.in_flight.remove(&self.range);
        }
    }
}
