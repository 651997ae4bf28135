//! In-flight repair attempts.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{RepairError, SessionStateError};
use crate::identity::{Node, TableReference};
use crate::timeuuid::TimeUuid;
use crate::token::TokenRange;

use super::entry::{HistoryRow, RepairStatus};
use super::store::HistoryStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionState {
    NoState,
    Started,
    Done,
}

/// Handle for one repair attempt of one token range.
///
/// `NoOp` is handed out when the participants do not match the topology;
/// it accepts `start` and `finish` without touching the history.
#[derive(Debug)]
pub enum RepairSession {
    Active(ActiveRepairSession),
    NoOp,
}

impl RepairSession {
    /// Writes one `STARTED` row per participant. Only valid once.
    pub fn start(&mut self) -> Result<(), RepairError> {
        match self {
            Self::Active(session) => session.start(),
            Self::NoOp => Ok(()),
        }
    }

    /// Records the terminal status on every participant row that exists.
    pub fn finish(&mut self, status: RepairStatus) -> Result<(), RepairError> {
        match self {
            Self::Active(session) => session.finish(status),
            Self::NoOp => Ok(()),
        }
    }

    pub fn repair_id(&self) -> Option<TimeUuid> {
        match self {
            Self::Active(session) => Some(session.repair_id),
            Self::NoOp => None,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }
}

pub struct ActiveRepairSession {
    store: Arc<dyn HistoryStore>,
    table: TableReference,
    job_id: Uuid,
    coordinator_id: Uuid,
    range: TokenRange,
    participants: BTreeSet<Node>,
    repair_id: TimeUuid,
    state: SessionState,
}

impl std::fmt::Debug for ActiveRepairSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveRepairSession")
            .field("table", &self.table)
            .field("job_id", &self.job_id)
            .field("range", &self.range)
            .field("repair_id", &self.repair_id)
            .field("state", &self.state)
            .finish()
    }
}

impl ActiveRepairSession {
    pub(crate) fn new(
        store: Arc<dyn HistoryStore>,
        table: TableReference,
        job_id: Uuid,
        coordinator_id: Uuid,
        range: TokenRange,
        participants: BTreeSet<Node>,
    ) -> Self {
        Self {
            store,
            table,
            job_id,
            coordinator_id,
            range,
            participants,
            repair_id: TimeUuid::now(),
            state: SessionState::NoState,
        }
    }

    fn start(&mut self) -> Result<(), RepairError> {
        if self.state != SessionState::NoState {
            return Err(SessionStateError::AlreadyUsed.into());
        }
        // A failed start still counts as used so that finish can clean up what was written.
        self.state = SessionState::Started;

        let (range_begin, range_end) = self.range.to_columns();
        let started_at = self.repair_id.timestamp();
        let mut first_err = None;
        for node in &self.participants {
            let row = HistoryRow {
                table_id: self.table.id,
                node_id: node.id,
                repair_id: self.repair_id,
                job_id: self.job_id,
                coordinator_id: self.coordinator_id,
                range_begin: range_begin.clone(),
                range_end: range_end.clone(),
                status: RepairStatus::Started,
                started_at,
                finished_at: None,
            };
            if let Err(e) = self.store.insert(&row) {
                warn!(
                    table = %self.table,
                    range = %self.range,
                    node = %node.id,
                    repair_id = %self.repair_id,
                    error = %e,
                    "failed to record repair start"
                );
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn finish(&mut self, status: RepairStatus) -> Result<(), RepairError> {
        match self.state {
            SessionState::NoState => return Err(SessionStateError::NotStarted.into()),
            SessionState::Done => return Err(SessionStateError::AlreadyFinished.into()),
            SessionState::Started => {}
        }
        self.state = SessionState::Done;

        let status = if status.is_terminal() {
            status
        } else {
            RepairStatus::Unknown
        };
        let finished_at = Utc::now().max(self.repair_id.timestamp());
        let mut first_err = None;
        for node in &self.participants {
            match self.store.update_status(
                self.table.id,
                node.id,
                &self.repair_id,
                status,
                finished_at,
            ) {
                Ok(true) => {}
                Ok(false) => debug!(
                    table = %self.table,
                    node = %node.id,
                    repair_id = %self.repair_id,
                    "no start row to finish"
                ),
                Err(e) => {
                    warn!(
                        table = %self.table,
                        range = %self.range,
                        node = %node.id,
                        repair_id = %self.repair_id,
                        error = %e,
                        "failed to record repair finish"
                    );
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
