//! Activation and shutdown of the whole repair engine.

use std::sync::Arc;

use antientropy_kernel::{HistoryStore, Node, RepairError, RepairHistory, ReplicationState};
use tracing::info;

use crate::config::SchedulerConfig;
use crate::fault::{LoggingFaultReporter, RepairFaultReporter};
use crate::lock::LockService;
use crate::metrics::{NoopTableRepairMetrics, TableRepairMetrics};
use crate::policy::RepairPolicy;
use crate::rpc::RepairRpc;
use crate::scheduler::RepairScheduler;
use crate::scheduling::ScheduleManager;

/// External systems the engine is wired to.
pub struct Collaborators {
    pub local_node: Node,
    pub history_store: Arc<dyn HistoryStore>,
    pub replication_state: Arc<dyn ReplicationState>,
    pub lock_service: Arc<dyn LockService>,
    pub repair_rpc: Arc<dyn RepairRpc>,
    pub metrics: Arc<dyn TableRepairMetrics>,
    pub fault_reporter: Arc<dyn RepairFaultReporter>,
    pub policies: Vec<Arc<dyn RepairPolicy>>,
}

impl Collaborators {
    /// Collaborators with no-op metrics, log-only faults and no policies.
    pub fn new(
        local_node: Node,
        history_store: Arc<dyn HistoryStore>,
        replication_state: Arc<dyn ReplicationState>,
        lock_service: Arc<dyn LockService>,
        repair_rpc: Arc<dyn RepairRpc>,
    ) -> Self {
        Self {
            local_node,
            history_store,
            replication_state,
            lock_service,
            repair_rpc,
            metrics: Arc::new(NoopTableRepairMetrics),
            fault_reporter: Arc::new(LoggingFaultReporter),
            policies: Vec::new(),
        }
    }
}

/// A running repair engine.
pub struct RepairSchedulerService {
    scheduler: RepairScheduler,
    schedule_manager: Arc<ScheduleManager>,
    history: Arc<RepairHistory>,
}

impl RepairSchedulerService {
    /// Wire the engine and start its ticker on `handle`. A history store
    /// whose schema cannot be used aborts activation.
    pub fn activate(
        config: &SchedulerConfig,
        collaborators: Collaborators,
        handle: &tokio::runtime::Handle,
    ) -> Result<Self, RepairError> {
        config.validate()?;
        collaborators.history_store.verify_schema()?;

        let history = Arc::new(
            RepairHistory::builder()
                .with_local_node(collaborators.local_node.clone())
                .with_store(collaborators.history_store)
                .with_replication_state(collaborators.replication_state.clone())
                .with_lookback(config.lookback)
                .build()?,
        );
        let schedule_manager = Arc::new(ScheduleManager::new(
            config,
            collaborators.lock_service,
            collaborators.local_node.id.to_string(),
        )?);
        let scheduler = RepairScheduler::builder()
            .with_fault_reporter(collaborators.fault_reporter)
            .with_repair_rpc(collaborators.repair_rpc)
            .with_table_repair_metrics(collaborators.metrics)
            .with_schedule_manager(schedule_manager.clone())
            .with_replication_state(collaborators.replication_state)
            .with_repair_policies(collaborators.policies)
            .with_repair_history(history.clone())
            .with_repair_lock_type(config.repair_lock_type)
            .build()?;
        schedule_manager.start(handle)?;
        info!(
            node = %collaborators.local_node,
            lock_type = ?config.repair_lock_type,
            "repair scheduler activated"
        );
        Ok(Self {
            scheduler,
            schedule_manager,
            history,
        })
    }

    pub fn scheduler(&self) -> &RepairScheduler {
        &self.scheduler
    }

    pub fn history(&self) -> &Arc<RepairHistory> {
        &self.history
    }

    /// Cancel every job and wait for running tasks to drain.
    pub async fn deactivate(self) {
        self.scheduler.close();
        self.schedule_manager.shutdown().await;
        info!("repair scheduler deactivated");
    }
}
