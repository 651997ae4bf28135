//! Fault alarms raised by repair jobs.

use std::fmt;

use antientropy_kernel::TableReference;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultCode {
    /// The table has not been fully repaired within its warning time.
    RepairWarning,
    /// The table has not been fully repaired within its error time.
    RepairError,
    /// Consecutive sub-task failures reached the configured threshold.
    RepairFailure,
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RepairWarning => "REPAIR_WARNING",
            Self::RepairError => "REPAIR_ERROR",
            Self::RepairFailure => "REPAIR_FAILURE",
        };
        f.write_str(s)
    }
}

/// Receiver of fault alarms. `cease` clears an alarm raised earlier.
pub trait RepairFaultReporter: Send + Sync {
    fn raise(&self, code: FaultCode, table: &TableReference, detail: &str);
    fn cease(&self, code: FaultCode, table: &TableReference);
}

/// Reports faults through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingFaultReporter;

impl RepairFaultReporter for LoggingFaultReporter {
    fn raise(&self, code: FaultCode, table: &TableReference, detail: &str) {
        match code {
            FaultCode::RepairWarning => warn!(table = %table, code = %code, detail, "repair fault raised"),
            FaultCode::RepairError | FaultCode::RepairFailure => {
                error!(table = %table, code = %code, detail, "repair fault raised")
            }
        }
    }

    fn cease(&self, code: FaultCode, table: &TableReference) {
        info!(table = %table, code = %code, "repair fault ceased");
    }
}
