//! Identities of replicated tables and replica nodes.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A replicated table: keyspace, table name and the table id assigned by the database.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableReference {
    pub keyspace: String,
    pub table: String,
    pub id: Uuid,
}

impl TableReference {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>, id: Uuid) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
            id,
        }
    }
}

impl fmt::Display for TableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.keyspace, self.table)
    }
}

/// A replica node. The id is the host id of the database node; the
/// datacenter scopes datacenter-wide repair locks.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub datacenter: String,
}

impl Node {
    pub fn new(id: Uuid, datacenter: impl Into<String>) -> Self {
        Self {
            id,
            datacenter: datacenter.into(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.datacenter)
    }
}
