//! Repair history records.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::Node;
use crate::timeuuid::TimeUuid;
use crate::token::TokenRange;

/// Outcome of one repair attempt. Only `Started` is non-terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairStatus {
    Started,
    Success,
    Failed,
    Unknown,
}

impl RepairStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Unrecognised values read back as `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "STARTED" => Self::Started,
            "SUCCESS" => Self::Success,
            "FAILED" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

impl fmt::Display for RepairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted row of `repair_history`, keyed by `(table_id, node_id)` and
/// clustered by `repair_id` descending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub table_id: Uuid,
    pub node_id: Uuid,
    pub repair_id: TimeUuid,
    pub job_id: Uuid,
    pub coordinator_id: Uuid,
    pub range_begin: String,
    pub range_end: String,
    pub status: RepairStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl HistoryRow {
    pub fn range(&self) -> Option<TokenRange> {
        TokenRange::from_columns(&self.range_begin, &self.range_end)
    }
}

/// A repair attempt as seen by readers of the history: the persisted row
/// plus the replicas of its range under the current topology.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairEntry {
    pub repair_id: TimeUuid,
    pub job_id: Uuid,
    pub coordinator_id: Uuid,
    pub range: TokenRange,
    pub participants: BTreeSet<Node>,
    pub status: RepairStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
