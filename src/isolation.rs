use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ProbeError;

/// The four standard isolation levels a target store is probed under.
///
/// Variants are declared weakest first; the derived ordering is the order in
/// which the matrix iterates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    /// **Read Uncommitted:**
    ///
    /// Reads may observe writes of transactions that have not committed yet
    /// (dirty reads). Non-repeatable reads and phantom reads are allowed.
    ReadUncommitted,
    /// **Read Committed:**
    ///
    /// Any data read is committed at the moment it is read. Reading the same
    /// row twice may return different values if another transaction commits
    /// a change in between. Phantom reads are allowed.
    ReadCommitted,
    /// **Repeatable Read:**
    ///
    /// Once a row has been read, later reads of that row within the same
    /// transaction return the same value. Range predicates are not protected,
    /// so rows inserted by others may still appear (phantom reads).
    RepeatableRead,
    /// **Serializable:**
    ///
    /// Transactions behave as if executed one after another. Dirty reads,
    /// non-repeatable reads and phantom reads are all prevented, either by
    /// blocking the conflicting statement or by rejecting it.
    Serializable,
}

impl IsolationLevel {
    /// Every level, weakest first.
    pub const ALL: [IsolationLevel; 4] = [
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    /// The SQL spelling used in `SET TRANSACTION ISOLATION LEVEL ...`.
    pub fn sql_name(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "read-uncommitted",
            IsolationLevel::ReadCommitted => "read-committed",
            IsolationLevel::RepeatableRead => "repeatable-read",
            IsolationLevel::Serializable => "serializable",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

impl FromStr for IsolationLevel {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                '_' | ' ' => '-',
                other => other.to_ascii_lowercase(),
            })
            .collect();
        IsolationLevel::ALL
            .into_iter()
            .find(|level| level.slug() == normalized)
            .ok_or_else(|| ProbeError::Configuration(format!("unknown isolation level '{s}'")))
    }
}
