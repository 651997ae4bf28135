//! Ticker and worker pool driving [ScheduledJob]s.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use antientropy_kernel::{Node, RepairError};
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::lock::{LeaseConfig, LeaseManager, LockGuard, LockLeaseManager, LockService};

use super::{BusyReplicas, ScheduledJob, ScheduledTask};

/// What happened to the task picked by one scheduling attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// No job had a runnable task.
    Idle,
    Executed,
    Failed,
    /// Every candidate's locks were held elsewhere; retried on a later tick.
    Deferred,
}

struct Claimed {
    job_id: Uuid,
    task: Box<dyn ScheduledTask>,
    replicas: BTreeSet<Node>,
}

/// Unclaims the task's replicas however the execution ends.
struct ClaimRelease<'a> {
    busy: &'a Mutex<BusyReplicas>,
    replicas: &'a BTreeSet<Node>,
}

impl Drop for ClaimRelease<'_> {
    fn drop(&mut self) {
        if let Ok(mut busy) = self.busy.lock() {
            busy.unclaim(self.replicas);
        }
    }
}

struct ManagerInner {
    holder: String,
    tick_interval: Duration,
    worker_count: usize,
    lock_retry_attempts: u32,
    lock_retry_delay: Duration,
    lock_service: Arc<dyn LockService>,
    lease_manager: LockLeaseManager,
    jobs: RwLock<BTreeMap<Uuid, Arc<dyn ScheduledJob>>>,
    busy: Mutex<BusyReplicas>,
    workers: Arc<Semaphore>,
    shut_down: AtomicBool,
}

pub struct ScheduleManager {
    inner: Arc<ManagerInner>,
    ticker: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl ScheduleManager {
    /// `holder` names this process in the lock service, usually the local node id.
    pub fn new(
        config: &SchedulerConfig,
        lock_service: Arc<dyn LockService>,
        holder: impl Into<String>,
    ) -> Result<Self, RepairError> {
        config.validate()?;
        let lease_config = LeaseConfig {
            lease_ttl: chrono::Duration::from_std(config.lock_ttl)
                .map_err(|e| RepairError::Config(format!("invalid lock ttl: {e}")))?,
            ..LeaseConfig::default()
        };
        Ok(Self {
            inner: Arc::new(ManagerInner {
                holder: holder.into(),
                tick_interval: config.tick_interval,
                worker_count: config.worker_count,
                lock_retry_attempts: config.lock_retry_attempts,
                lock_retry_delay: config.lock_retry_delay,
                lease_manager: LockLeaseManager::new(lock_service.clone(), lease_config),
                lock_service,
                jobs: RwLock::new(BTreeMap::new()),
                busy: Mutex::new(BusyReplicas::default()),
                workers: Arc::new(Semaphore::new(config.worker_count)),
                shut_down: AtomicBool::new(false),
            }),
            ticker: Mutex::new(None),
        })
    }

    pub fn schedule(&self, job: Arc<dyn ScheduledJob>) -> Result<(), RepairError> {
        if self.inner.is_shut_down() {
            return Err(RepairError::Shutdown);
        }
        let mut jobs = self.inner.jobs_mut()?;
        debug!(job_id = %job.id(), "job scheduled");
        jobs.insert(job.id(), job);
        Ok(())
    }

    /// Forget a job. A task of it that is already running is left alone.
    pub fn deschedule(&self, job_id: Uuid) -> Result<bool, RepairError> {
        let mut jobs = self.inner.jobs_mut()?;
        Ok(jobs.remove(&job_id).is_some())
    }

    pub fn job_ids(&self) -> Vec<Uuid> {
        self.inner
            .jobs
            .read()
            .map(|jobs| jobs.keys().copied().collect())
            .unwrap_or_default()
    }

    /// One scheduling round on the calling thread: run the highest-priority
    /// task whose locks are free, trying jobs in priority order.
    pub fn run_once(&self, now: DateTime<Utc>) -> Result<TaskOutcome, RepairError> {
        if self.inner.is_shut_down() {
            return Err(RepairError::Shutdown);
        }
        self.inner.tick_leases(now);
        let mut outcome = TaskOutcome::Idle;
        for job in self.inner.ordered_jobs(now) {
            let Some(claimed) = self.inner.claim(&job, now) else {
                continue;
            };
            match self.inner.run_claimed(claimed) {
                TaskOutcome::Deferred => outcome = TaskOutcome::Deferred,
                done => return Ok(done),
            }
        }
        Ok(outcome)
    }

    /// Start the ticker on `handle`. Tasks run on blocking workers, at most
    /// `worker_count` at a time.
    pub fn start(&self, handle: &tokio::runtime::Handle) -> Result<(), RepairError> {
        if self.inner.is_shut_down() {
            return Err(RepairError::Shutdown);
        }
        let mut ticker = self
            .ticker
            .lock()
            .map_err(|_| RepairError::Driver("schedule manager ticker poisoned".to_string()))?;
        if ticker.is_some() {
            return Ok(());
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let join = handle.spawn(run_ticker(inner, stop_rx));
        *ticker = Some((stop_tx, join));
        info!(
            workers = self.inner.worker_count,
            tick_ms = self.inner.tick_interval.as_millis() as u64,
            "schedule manager started"
        );
        Ok(())
    }

    /// Stop dispatching and wait for running tasks to finish.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let ticker = self.ticker.lock().ok().and_then(|mut t| t.take());
        if let Some((stop_tx, join)) = ticker {
            let _ = stop_tx.send(true);
            if let Err(e) = join.await {
                warn!(error = %e, "schedule manager ticker ended abnormally");
            }
        }
        match self
            .inner
            .workers
            .acquire_many(self.inner.worker_count as u32)
            .await
        {
            Ok(permits) => drop(permits),
            Err(e) => warn!(error = %e, "worker pool closed before draining"),
        }
        info!("schedule manager stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }
}

impl ManagerInner {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn jobs_mut(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<Uuid, Arc<dyn ScheduledJob>>>, RepairError>
    {
        self.jobs
            .write()
            .map_err(|_| RepairError::Driver("schedule manager job table poisoned".to_string()))
    }

    fn tick_leases(&self, now: DateTime<Utc>) {
        match self.lease_manager.tick(now) {
            Ok(result) if result.expired > 0 => {
                debug!(expired = result.expired, "expired stale lock leases")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "lock lease tick failed"),
        }
    }

    /// Refreshed, runnable jobs, highest priority first.
    fn ordered_jobs(&self, now: DateTime<Utc>) -> Vec<Arc<dyn ScheduledJob>> {
        let jobs: Vec<_> = match self.jobs.read() {
            Ok(jobs) => jobs.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };
        let mut ranked = Vec::with_capacity(jobs.len());
        for job in jobs {
            if job.is_cancelled() {
                continue;
            }
            if let Err(e) = job.refresh(now) {
                warn!(job_id = %job.id(), error = %e, "failed to refresh job state");
            }
            let priority = job.priority(now);
            if priority > 0 {
                ranked.push((priority, job));
            }
        }
        ranked.sort_by(|(pa, a), (pb, b)| pb.cmp(pa).then_with(|| a.id().cmp(&b.id())));
        ranked.into_iter().map(|(_, job)| job).collect()
    }

    fn claim(&self, job: &Arc<dyn ScheduledJob>, now: DateTime<Utc>) -> Option<Claimed> {
        if self.is_shut_down() || job.is_cancelled() {
            return None;
        }
        let mut busy = self.busy.lock().ok()?;
        let task = job.next_task(now, &busy)?;
        let replicas = task.replicas().clone();
        busy.claim(&replicas);
        Some(Claimed {
            job_id: job.id(),
            task,
            replicas,
        })
    }

    fn run_claimed(&self, claimed: Claimed) -> TaskOutcome {
        let Claimed {
            job_id,
            task,
            replicas,
        } = claimed;
        let _release = ClaimRelease {
            busy: &self.busy,
            replicas: &replicas,
        };

        let lease = self.lease_manager.config();
        let ttl = lease.ttl();
        let scopes = task.lock_scopes();
        let mut guard = match LockGuard::acquire_with_retry(
            self.lock_service.clone(),
            &scopes,
            &self.holder,
            ttl,
            self.lock_retry_attempts,
            self.lock_retry_delay,
        ) {
            Ok(guard) => guard,
            Err(RepairError::LockBusy(reason)) => {
                debug!(job_id = %job_id, reason = %reason, "task deferred, lock busy");
                return TaskOutcome::Deferred;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "task deferred, lock service failed");
                return TaskOutcome::Deferred;
            }
        };
        if let Err(e) = guard.refresh(ttl) {
            warn!(job_id = %job_id, error = %e, "lock lost before task start");
            return TaskOutcome::Deferred;
        }

        let (result, held) = guard.hold_while(ttl, lease.heartbeat_interval(), |fence| {
            (task.execute(fence), fence.is_held())
        });
        drop(guard);
        match result {
            Ok(()) if held => TaskOutcome::Executed,
            Ok(()) => {
                error!(job_id = %job_id, "task finished after losing its locks");
                TaskOutcome::Failed
            }
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "task failed");
                TaskOutcome::Failed
            }
        }
    }
}

async fn run_ticker(inner: Arc<ManagerInner>, mut stop: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(inner.tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        if inner.is_shut_down() {
            break;
        }

        let now = Utc::now();
        let ranked = {
            let inner = inner.clone();
            tokio::task::spawn_blocking(move || {
                inner.tick_leases(now);
                inner.ordered_jobs(now)
            })
            .await
        };
        let ranked = match ranked {
            Ok(ranked) => ranked,
            Err(e) => {
                warn!(error = %e, "job refresh panicked");
                continue;
            }
        };

        'dispatch: for job in ranked {
            loop {
                if inner.is_shut_down() {
                    break 'dispatch;
                }
                let Ok(permit) = inner.workers.clone().try_acquire_owned() else {
                    break 'dispatch;
                };
                let Some(claimed) = inner.claim(&job, now) else {
                    drop(permit);
                    break;
                };
                let worker = inner.clone();
                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    worker.run_claimed(claimed)
                });
            }
        }
    }
    debug!("schedule manager ticker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::lock::{InMemoryLockService, LockFence, LockScope};

    struct CountingTask {
        replicas: BTreeSet<Node>,
        scopes: Vec<LockScope>,
        runs: Arc<AtomicUsize>,
        fail: bool,
        hold: Duration,
    }

    impl ScheduledTask for CountingTask {
        fn replicas(&self) -> &BTreeSet<Node> {
            &self.replicas
        }

        fn lock_scopes(&self) -> Vec<LockScope> {
            self.scopes.clone()
        }

        fn execute(self: Box<Self>, _fence: &LockFence) -> Result<(), RepairError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if !self.hold.is_zero() {
                std::thread::sleep(self.hold);
            }
            if self.fail {
                Err(RepairError::Rpc("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    struct FixedJob {
        id: Uuid,
        priority: i64,
        replicas: BTreeSet<Node>,
        scope: LockScope,
        runs: Arc<AtomicUsize>,
        fail: bool,
        hold: Duration,
    }

    impl FixedJob {
        fn new(priority: i64, replicas: BTreeSet<Node>, scope: &str) -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                priority,
                replicas,
                scope: LockScope::Datacenter(scope.into()),
                runs: Arc::new(AtomicUsize::new(0)),
                fail: false,
                hold: Duration::ZERO,
            })
        }
    }

    impl ScheduledJob for FixedJob {
        fn id(&self) -> Uuid {
            self.id
        }

        fn refresh(&self, _now: DateTime<Utc>) -> Result<(), RepairError> {
            Ok(())
        }

        fn priority(&self, _now: DateTime<Utc>) -> i64 {
            self.priority
        }

        fn next_task(
            &self,
            _now: DateTime<Utc>,
            busy: &BusyReplicas,
        ) -> Option<Box<dyn ScheduledTask>> {
            if busy.overlaps(&self.replicas) {
                return None;
            }
            Some(Box::new(CountingTask {
                replicas: self.replicas.clone(),
                scopes: vec![self.scope.clone()],
                runs: self.runs.clone(),
                fail: self.fail,
                hold: self.hold,
            }))
        }
    }

    fn nodes(n: usize) -> BTreeSet<Node> {
        (0..n).map(|_| Node::new(Uuid::new_v4(), "dc1")).collect()
    }

    fn manager(lock_service: Arc<dyn LockService>) -> ScheduleManager {
        let config = SchedulerConfig {
            lock_retry_attempts: 1,
            ..SchedulerConfig::default()
        };
        ScheduleManager::new(&config, lock_service, "local").expect("manager")
    }

    #[test]
    fn highest_priority_job_runs_first() {
        let manager = manager(Arc::new(InMemoryLockService::new()));
        let low = FixedJob::new(1, nodes(2), "a");
        let high = FixedJob::new(5, nodes(2), "b");
        manager.schedule(low.clone()).expect("schedule low");
        manager.schedule(high.clone()).expect("schedule high");

        assert_eq!(manager.run_once(Utc::now()).expect("run"), TaskOutcome::Executed);
        assert_eq!(high.runs.load(Ordering::SeqCst), 1);
        assert_eq!(low.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn busy_lock_falls_through_to_next_job() {
        let locks = Arc::new(InMemoryLockService::new());
        let manager = manager(locks.clone());
        let high = FixedJob::new(5, nodes(2), "held");
        let low = FixedJob::new(1, nodes(2), "free");
        manager.schedule(high.clone()).expect("schedule");
        manager.schedule(low.clone()).expect("schedule");

        let _held = LockGuard::acquire(
            locks,
            &[LockScope::Datacenter("held".into())],
            "other-process",
            Duration::from_secs(60),
        )
        .expect("hold lock");

        assert_eq!(manager.run_once(Utc::now()).expect("run"), TaskOutcome::Executed);
        assert_eq!(high.runs.load(Ordering::SeqCst), 0);
        assert_eq!(low.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn all_locks_busy_defers() {
        let locks = Arc::new(InMemoryLockService::new());
        let manager = manager(locks.clone());
        let job = FixedJob::new(1, nodes(1), "held");
        manager.schedule(job.clone()).expect("schedule");
        let _held = LockGuard::acquire(
            locks,
            &[LockScope::Datacenter("held".into())],
            "other-process",
            Duration::from_secs(60),
        )
        .expect("hold lock");
        assert_eq!(manager.run_once(Utc::now()).expect("run"), TaskOutcome::Deferred);
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_task_reports_failure() {
        let manager = manager(Arc::new(InMemoryLockService::new()));
        let job = Arc::new(FixedJob {
            fail: true,
            ..Arc::try_unwrap(FixedJob::new(1, nodes(1), "a")).ok().expect("unique")
        });
        manager.schedule(job.clone()).expect("schedule");
        assert_eq!(manager.run_once(Utc::now()).expect("run"), TaskOutcome::Failed);
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn locks_stay_held_while_a_task_outlives_the_ttl() {
        let locks = Arc::new(InMemoryLockService::new());
        let config = SchedulerConfig {
            lock_retry_attempts: 1,
            lock_ttl: Duration::from_millis(100),
            ..SchedulerConfig::default()
        };
        let manager = Arc::new(
            ScheduleManager::new(&config, locks.clone(), "node-a").expect("manager"),
        );
        let replicas = nodes(2);
        let scope = LockScope::vnode(&replicas);
        let job = Arc::new(FixedJob {
            hold: Duration::from_millis(600),
            scope: scope.clone(),
            ..Arc::try_unwrap(FixedJob::new(1, replicas, "unused")).ok().expect("unique")
        });
        manager.schedule(job.clone()).expect("schedule");

        let runner = {
            let manager = manager.clone();
            std::thread::spawn(move || manager.run_once(Utc::now()))
        };
        std::thread::sleep(Duration::from_millis(300));
        let second = LockGuard::acquire(
            locks.clone(),
            &[scope.clone()],
            "node-b",
            Duration::from_secs(60),
        );
        assert!(
            matches!(second, Err(RepairError::LockBusy(_))),
            "another holder took the lock mid-task"
        );
        assert_eq!(locks.holder(&scope.resource()).as_deref(), Some("node-a"));

        let outcome = runner.join().expect("runner").expect("run");
        assert_eq!(outcome, TaskOutcome::Executed);
        assert_eq!(locks.holder(&scope.resource()), None);
    }

    #[test]
    fn idle_without_runnable_jobs() {
        let manager = manager(Arc::new(InMemoryLockService::new()));
        manager
            .schedule(FixedJob::new(0, nodes(1), "a"))
            .expect("schedule");
        assert_eq!(manager.run_once(Utc::now()).expect("run"), TaskOutcome::Idle);
    }

    #[test]
    fn descheduled_job_is_not_consulted() {
        let manager = manager(Arc::new(InMemoryLockService::new()));
        let job = FixedJob::new(3, nodes(1), "a");
        manager.schedule(job.clone()).expect("schedule");
        assert!(manager.deschedule(job.id).expect("deschedule"));
        assert_eq!(manager.run_once(Utc::now()).expect("run"), TaskOutcome::Idle);
        assert!(manager.job_ids().is_empty());
    }

    #[test]
    fn claims_block_overlapping_replicas() {
        let inner = manager(Arc::new(InMemoryLockService::new())).inner;
        let shared = nodes(2);
        let first = FixedJob::new(2, shared.clone(), "a");
        let second = FixedJob::new(1, shared, "b");
        let first_dyn: Arc<dyn ScheduledJob> = first;
        let second_dyn: Arc<dyn ScheduledJob> = second;

        let claimed = inner.claim(&first_dyn, Utc::now()).expect("first claim");
        assert!(inner.claim(&second_dyn, Utc::now()).is_none());
        assert_eq!(inner.run_claimed(claimed), TaskOutcome::Executed);
        assert!(inner.claim(&second_dyn, Utc::now()).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ticker_runs_jobs_until_shutdown() {
        let config = SchedulerConfig {
            tick_interval: Duration::from_millis(10),
            worker_count: 2,
            ..SchedulerConfig::default()
        };
        let manager = ScheduleManager::new(&config, Arc::new(InMemoryLockService::new()), "local")
            .expect("manager");
        let job = FixedJob::new(1, nodes(1), "a");
        manager.schedule(job.clone()).expect("schedule");
        manager
            .start(&tokio::runtime::Handle::current())
            .expect("start");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while job.runs.load(Ordering::SeqCst) < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.shutdown().await;
        let runs = job.runs.load(Ordering::SeqCst);
        assert!(runs >= 3, "expected at least 3 runs, got {runs}");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(job.runs.load(Ordering::SeqCst), runs);
        assert!(matches!(
            manager.run_once(Utc::now()),
            Err(RepairError::Shutdown)
        ));
    }
}
