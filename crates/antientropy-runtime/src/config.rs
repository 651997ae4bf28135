//! Scheduler and per-table repair configuration.
//!
//! Durations are carried as [std::time::Duration] and written as integer
//! milliseconds (`*_ms` keys) on the wire.

use std::time::Duration;

use antientropy_kernel::RepairError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Scope of the distributed lock taken around every repair task.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairLockType {
    /// One lock per replica set.
    #[default]
    Vnode,
    /// One lock per datacenter touched by the replica set.
    Datacenter,
    /// Both of the above.
    DatacenterAndVnode,
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_worker_count() -> usize {
    1
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_lock_retry_attempts() -> u32 {
    3
}

fn default_lock_retry_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_lookback() -> Duration {
    30 * DAY
}

/// Engine-wide settings accepted at activation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub repair_lock_type: RepairLockType,
    #[serde(rename = "tick_interval_ms", with = "millis", default = "default_tick_interval")]
    #[schemars(with = "u64")]
    pub tick_interval: Duration,
    /// Upper bound on concurrently executing repair tasks in this process.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(rename = "lock_ttl_ms", with = "millis", default = "default_lock_ttl")]
    #[schemars(with = "u64")]
    pub lock_ttl: Duration,
    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,
    #[serde(rename = "lock_retry_delay_ms", with = "millis", default = "default_lock_retry_delay")]
    #[schemars(with = "u64")]
    pub lock_retry_delay: Duration,
    /// History retention horizon; older entries are never read.
    #[serde(rename = "lookback_ms", with = "millis", default = "default_lookback")]
    #[schemars(with = "u64")]
    pub lookback: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            repair_lock_type: RepairLockType::default(),
            tick_interval: default_tick_interval(),
            worker_count: default_worker_count(),
            lock_ttl: default_lock_ttl(),
            lock_retry_attempts: default_lock_retry_attempts(),
            lock_retry_delay: default_lock_retry_delay(),
            lookback: default_lookback(),
        }
    }
}

impl SchedulerConfig {
    #[cfg(feature = "toml")]
    pub fn from_toml_str(input: &str) -> Result<Self, RepairError> {
        let config: Self =
            toml::from_str(input).map_err(|e| RepairError::Config(format!("parse toml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RepairError> {
        if self.tick_interval.is_zero() {
            return Err(RepairError::Config("tick_interval must be positive".into()));
        }
        if self.worker_count == 0 {
            return Err(RepairError::Config("worker_count must be at least 1".into()));
        }
        if self.lock_ttl.is_zero() {
            return Err(RepairError::Config("lock_ttl must be positive".into()));
        }
        if self.lock_retry_attempts == 0 {
            return Err(RepairError::Config(
                "lock_retry_attempts must be at least 1".into(),
            ));
        }
        if self.lookback.is_zero() {
            return Err(RepairError::Config("lookback must be positive".into()));
        }
        Ok(())
    }
}

fn default_repair_interval() -> Duration {
    7 * DAY
}

fn default_parallelism() -> usize {
    1
}

fn default_priority() -> i64 {
    1
}

fn default_priority_granularity() -> Duration {
    HOUR
}

fn default_repair_warning_time() -> Duration {
    8 * DAY
}

fn default_repair_error_time() -> Duration {
    10 * DAY
}

fn default_backoff_initial() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_failure_fault_threshold() -> u32 {
    3
}

/// Per-table repair settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RepairConfiguration {
    /// Target age of the oldest repaired range.
    #[serde(rename = "repair_interval_ms", with = "millis", default = "default_repair_interval")]
    #[schemars(with = "u64")]
    pub repair_interval: Duration,
    /// Sub-tasks of this table allowed in flight at once.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Base priority, multiplied by how many granularity steps the table is overdue.
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(
        rename = "priority_granularity_ms",
        with = "millis",
        default = "default_priority_granularity"
    )]
    #[schemars(with = "u64")]
    pub priority_granularity: Duration,
    /// Pause after each sub-task, as a multiple of its run time.
    #[serde(default)]
    pub unwind_ratio: f64,
    #[serde(
        rename = "repair_warning_time_ms",
        with = "millis",
        default = "default_repair_warning_time"
    )]
    #[schemars(with = "u64")]
    pub repair_warning_time: Duration,
    #[serde(
        rename = "repair_error_time_ms",
        with = "millis",
        default = "default_repair_error_time"
    )]
    #[schemars(with = "u64")]
    pub repair_error_time: Duration,
    /// First retry delay of a failed range; doubles per failure up to the interval.
    #[serde(rename = "backoff_initial_ms", with = "millis", default = "default_backoff_initial")]
    #[schemars(with = "u64")]
    pub backoff_initial: Duration,
    /// Consecutive failures before a fault is raised.
    #[serde(default = "default_failure_fault_threshold")]
    pub failure_fault_threshold: u32,
}

impl Default for RepairConfiguration {
    fn default() -> Self {
        Self {
            repair_interval: default_repair_interval(),
            parallelism: default_parallelism(),
            priority: default_priority(),
            priority_granularity: default_priority_granularity(),
            unwind_ratio: 0.0,
            repair_warning_time: default_repair_warning_time(),
            repair_error_time: default_repair_error_time(),
            backoff_initial: default_backoff_initial(),
            failure_fault_threshold: default_failure_fault_threshold(),
        }
    }
}

impl RepairConfiguration {
    pub fn validate(&self) -> Result<(), RepairError> {
        if self.repair_interval.is_zero() {
            return Err(RepairError::Config("repair_interval must be positive".into()));
        }
        if self.parallelism == 0 {
            return Err(RepairError::Config("parallelism must be at least 1".into()));
        }
        if self.priority <= 0 {
            return Err(RepairError::Config("priority must be positive".into()));
        }
        if self.priority_granularity.is_zero() {
            return Err(RepairError::Config(
                "priority_granularity must be positive".into(),
            ));
        }
        if !self.unwind_ratio.is_finite() || self.unwind_ratio < 0.0 {
            return Err(RepairError::Config(format!(
                "unwind_ratio must be a non-negative number, got {}",
                self.unwind_ratio
            )));
        }
        if self.repair_warning_time < self.repair_interval {
            return Err(RepairError::Config(
                "repair_warning_time must not be shorter than repair_interval".into(),
            ));
        }
        if self.repair_warning_time >= self.repair_error_time {
            return Err(RepairError::Config(
                "repair_warning_time must be shorter than repair_error_time".into(),
            ));
        }
        if self.backoff_initial.is_zero() {
            return Err(RepairError::Config("backoff_initial must be positive".into()));
        }
        if self.failure_fault_threshold == 0 {
            return Err(RepairError::Config(
                "failure_fault_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
