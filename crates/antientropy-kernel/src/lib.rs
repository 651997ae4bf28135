//! Antientropy kernel: the data model of a repair orchestrator and the
//! durable repair history it reads its progress back from.
//!
//! - [identity]: tables, replica nodes.
//! - [token]: token ranges on the signed 64-bit ring.
//! - [timeuuid]: time-ordered identifiers used as repair ids.
//! - [topology]: the replication-topology contract consumed by the history store.
//! - [history]: repair sessions, entries and the backends that persist them.

pub mod error;
pub mod history;
pub mod identity;
pub mod timeuuid;
pub mod token;
pub mod topology;

pub use error::{RepairError, SessionStateError};
pub use history::{
    ActiveRepairSession, EntryPredicate, HistoryRow, HistoryScan, HistoryStore,
    InMemoryHistoryStore, RepairEntries, RepairEntry, RepairEntryIter, RepairHistory,
    RepairHistoryBuilder, RepairHistoryProvider, RepairSession, RepairStatus,
};
#[cfg(feature = "kernel-postgres")]
pub use history::PostgresHistoryStore;
#[cfg(feature = "sqlite-persistence")]
pub use history::SqliteHistoryStore;
pub use identity::{Node, TableReference};
pub use timeuuid::TimeUuid;
pub use token::TokenRange;
pub use topology::{ReplicationState, StaticReplicationState};
