//! Registry of table repair jobs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use antientropy_kernel::{RepairError, RepairHistory, ReplicationState, TableReference};
use chrono::Utc;
use tracing::{debug, info};

use crate::config::{RepairConfiguration, RepairLockType};
use crate::fault::RepairFaultReporter;
use crate::metrics::TableRepairMetrics;
use crate::policy::RepairPolicy;
use crate::repair::{JobView, RepairJobContext, TableRepairJob};
use crate::rpc::RepairRpc;
use crate::scheduling::{ScheduleManager, ScheduledJob};

/// Keeps one [TableRepairJob] per configured table and registers it with
/// the [ScheduleManager].
pub struct RepairScheduler {
    ctx: Arc<RepairJobContext>,
    schedule_manager: Arc<ScheduleManager>,
    jobs: Mutex<BTreeMap<TableReference, Arc<TableRepairJob>>>,
}

impl RepairScheduler {
    pub fn builder() -> RepairSchedulerBuilder {
        RepairSchedulerBuilder::default()
    }

    fn jobs(
        &self,
    ) -> Result<MutexGuard<'_, BTreeMap<TableReference, Arc<TableRepairJob>>>, RepairError> {
        self.jobs
            .lock()
            .map_err(|_| RepairError::Driver("repair scheduler job table poisoned".to_string()))
    }

    /// Create or reconfigure the job of `table`. Reconfiguring keeps the
    /// job and its running task; the new settings apply from the next tick.
    pub fn put_configuration(
        &self,
        table: TableReference,
        config: RepairConfiguration,
    ) -> Result<(), RepairError> {
        config.validate()?;
        let mut jobs = self.jobs()?;
        if let Some(job) = jobs.get(&table) {
            if job.configuration() == config {
                debug!(table = %table, "repair configuration unchanged");
                return Ok(());
            }
            job.update_configuration(config)?;
            info!(table = %table, "repair configuration updated");
            return Ok(());
        }
        let job = Arc::new(TableRepairJob::new(table.clone(), config, self.ctx.clone())?);
        self.schedule_manager.schedule(job.clone())?;
        info!(table = %table, "repair job created");
        jobs.insert(table, job);
        Ok(())
    }

    /// Stop repairing `table`. A task already running completes normally.
    pub fn remove_configuration(&self, table: &TableReference) -> Result<(), RepairError> {
        let removed = self.jobs()?.remove(table);
        if let Some(job) = removed {
            job.cancel();
            self.schedule_manager.deschedule(job.id())?;
            info!(table = %table, "repair job removed");
        }
        Ok(())
    }

    pub fn list_current_jobs(&self) -> Vec<JobView> {
        let now = Utc::now();
        match self.jobs() {
            Ok(jobs) => jobs.values().map(|job| job.view(now)).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn job(&self, table: &TableReference) -> Option<Arc<TableRepairJob>> {
        self.jobs().ok()?.get(table).cloned()
    }

    /// Cancel and deregister every job.
    pub fn close(&self) {
        let jobs = match self.jobs() {
            Ok(mut jobs) => std::mem::take(&mut *jobs),
            Err(_) => return,
        };
        for (_, job) in jobs {
            job.cancel();
            let _ = self.schedule_manager.deschedule(job.id());
        }
    }
}

#[derive(Default)]
pub struct RepairSchedulerBuilder {
    fault_reporter: Option<Arc<dyn RepairFaultReporter>>,
    repair_rpc: Option<Arc<dyn RepairRpc>>,
    table_repair_metrics: Option<Arc<dyn TableRepairMetrics>>,
    schedule_manager: Option<Arc<ScheduleManager>>,
    replication_state: Option<Arc<dyn ReplicationState>>,
    repair_policies: Vec<Arc<dyn RepairPolicy>>,
    repair_history: Option<Arc<RepairHistory>>,
    repair_lock_type: RepairLockType,
}

impl RepairSchedulerBuilder {
    pub fn with_fault_reporter(mut self, reporter: Arc<dyn RepairFaultReporter>) -> Self {
        self.fault_reporter = Some(reporter);
        self
    }

    pub fn with_repair_rpc(mut self, rpc: Arc<dyn RepairRpc>) -> Self {
        self.repair_rpc = Some(rpc);
        self
    }

    pub fn with_table_repair_metrics(mut self, metrics: Arc<dyn TableRepairMetrics>) -> Self {
        self.table_repair_metrics = Some(metrics);
        self
    }

    pub fn with_schedule_manager(mut self, manager: Arc<ScheduleManager>) -> Self {
        self.schedule_manager = Some(manager);
        self
    }

    pub fn with_replication_state(mut self, state: Arc<dyn ReplicationState>) -> Self {
        self.replication_state = Some(state);
        self
    }

    pub fn with_repair_policies(
        mut self,
        policies: impl IntoIterator<Item = Arc<dyn RepairPolicy>>,
    ) -> Self {
        self.repair_policies.extend(policies);
        self
    }

    pub fn with_repair_history(mut self, history: Arc<RepairHistory>) -> Self {
        self.repair_history = Some(history);
        self
    }

    pub fn with_repair_lock_type(mut self, lock_type: RepairLockType) -> Self {
        self.repair_lock_type = lock_type;
        self
    }

    pub fn build(self) -> Result<RepairScheduler, RepairError> {
        fn missing(what: &str) -> RepairError {
            RepairError::Config(format!("repair scheduler requires {what}"))
        }
        let ctx = RepairJobContext {
            history: self.repair_history.ok_or_else(|| missing("a repair history"))?,
            replication_state: self
                .replication_state
                .ok_or_else(|| missing("a replication state"))?,
            rpc: self.repair_rpc.ok_or_else(|| missing("a repair rpc"))?,
            metrics: self
                .table_repair_metrics
                .ok_or_else(|| missing("table repair metrics"))?,
            fault_reporter: self
                .fault_reporter
                .ok_or_else(|| missing("a fault reporter"))?,
            policies: self.repair_policies,
            lock_type: self.repair_lock_type,
        };
        let schedule_manager = self
            .schedule_manager
            .ok_or_else(|| missing("a schedule manager"))?;
        Ok(RepairScheduler {
            ctx: Arc::new(ctx),
            schedule_manager,
            jobs: Mutex::new(BTreeMap::new()),
        })
    }
}
