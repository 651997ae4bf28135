//! Repair History Store: durable, replica-partitioned record of every
//! repair attempt, read back as a time-bounded lazy sequence.

pub mod entry;
pub mod memory;
#[cfg(feature = "kernel-postgres")]
pub mod postgres;
pub mod repair_history;
pub mod session;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite;
pub mod store;

pub use entry::{HistoryRow, RepairEntry, RepairStatus};
pub use memory::InMemoryHistoryStore;
#[cfg(feature = "kernel-postgres")]
pub use postgres::PostgresHistoryStore;
pub use repair_history::{
    EntryPredicate, RepairEntries, RepairEntryIter, RepairHistory, RepairHistoryBuilder,
    RepairHistoryProvider, DEFAULT_LOOKBACK_DAYS,
};
pub use session::{ActiveRepairSession, RepairSession};
#[cfg(feature = "sqlite-persistence")]
pub use sqlite::SqliteHistoryStore;
pub use store::{HistoryScan, HistoryStore};
