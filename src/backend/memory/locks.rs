use std::collections::VecDeque;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};

/// Mode of a row lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Taken by serializable reads. Compatible with other shared locks.
    Shared,
    /// Taken by writes at read-committed and above. Held to end of
    /// transaction.
    Exclusive,
}

#[derive(Debug, Default)]
struct RowLock {
    exclusive: Option<u64>,
    shared: HashSet<u64>,
}

impl RowLock {
    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

/// Row and predicate locks of the reference engine.
///
/// The table never waits itself: a request either is granted or names the
/// transaction standing in the way, and the engine decides how long to wait.
/// Waiters line up per resource (a row key or a marker) and are served in
/// arrival order.
#[derive(Debug, Default)]
pub struct LockTable {
    rows: HashMap<String, RowLock>,
    /// Marker value -> serializable transactions that counted that range.
    predicates: HashMap<String, HashSet<u64>>,
    queues: HashMap<String, VecDeque<u64>>,
}

impl LockTable {
    /// Grants `mode` on `key` to `txn` or returns the conflicting holder.
    /// Re-entrant, and upgrades shared to exclusive when `txn` is the only
    /// shared holder.
    pub fn try_row(&mut self, txn: u64, key: &str, mode: LockMode) -> Result<(), u64> {
        let lock = self.rows.entry(key.to_string()).or_default();
        if let Some(holder) = lock.exclusive {
            if holder == txn {
                return Ok(());
            }
            return Err(holder);
        }
        match mode {
            LockMode::Shared => {
                lock.shared.insert(txn);
                Ok(())
            }
            LockMode::Exclusive => {
                if let Some(other) = lock.shared.iter().copied().find(|&t| t != txn) {
                    return Err(other);
                }
                lock.shared.remove(&txn);
                lock.exclusive = Some(txn);
                Ok(())
            }
        }
    }

    /// Transaction other than `txn` holding a predicate lock on `marker`.
    pub fn predicate_holder(&self, txn: u64, marker: &str) -> Option<u64> {
        self.predicates
            .get(marker)
            .and_then(|holders| holders.iter().copied().find(|&t| t != txn))
    }

    pub fn grant_predicate(&mut self, txn: u64, marker: &str) {
        self.predicates
            .entry(marker.to_string())
            .or_default()
            .insert(txn);
    }

    /// Any lock `txn` already holds on `resource`.
    pub fn holds(&self, txn: u64, resource: &str) -> bool {
        self.rows
            .get(resource)
            .is_some_and(|lock| lock.exclusive == Some(txn) || lock.shared.contains(&txn))
            || self
                .predicates
                .get(resource)
                .is_some_and(|holders| holders.contains(&txn))
    }

    /// The waiter `txn` has to let go first, if any. A transaction that
    /// already holds a lock on `resource` never queues behind newcomers.
    pub fn queued_ahead(&self, txn: u64, resource: &str) -> Option<u64> {
        if self.holds(txn, resource) {
            return None;
        }
        self.queues
            .get(resource)
            .and_then(|queue| queue.front().copied())
            .filter(|&front| front != txn)
    }

    pub fn enqueue(&mut self, txn: u64, resource: &str) {
        let queue = self.queues.entry(resource.to_string()).or_default();
        if !queue.contains(&txn) {
            queue.push_back(txn);
        }
    }

    pub fn dequeue(&mut self, txn: u64, resource: &str) {
        if let Some(queue) = self.queues.get_mut(resource) {
            queue.retain(|&t| t != txn);
            if queue.is_empty() {
                self.queues.remove(resource);
            }
        }
    }

    /// Drops every lock `txn` holds.
    pub fn release_all(&mut self, txn: u64) {
        self.rows.retain(|_, lock| {
            if lock.exclusive == Some(txn) {
                lock.exclusive = None;
            }
            lock.shared.remove(&txn);
            !lock.is_free()
        });
        self.predicates.retain(|_, holders| {
            holders.remove(&txn);
            !holders.is_empty()
        });
        self.queues.retain(|_, queue| {
            queue.retain(|&t| t != txn);
            !queue.is_empty()
        });
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.predicates.is_empty() && self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_coexist_and_block_writers() {
        let mut table = LockTable::default();
        assert!(table.try_row(1, "k", LockMode::Shared).is_ok());
        assert!(table.try_row(2, "k", LockMode::Shared).is_ok());
        let blocker = table.try_row(3, "k", LockMode::Exclusive).unwrap_err();
        assert!(blocker == 1 || blocker == 2);
        table.release_all(1);
        table.release_all(2);
        assert!(table.try_row(3, "k", LockMode::Exclusive).is_ok());
        assert_eq!(table.try_row(1, "k", LockMode::Shared), Err(3));
    }

    #[test]
    fn sole_reader_upgrades() {
        let mut table = LockTable::default();
        table.try_row(7, "k", LockMode::Shared).unwrap();
        table.try_row(7, "k", LockMode::Exclusive).unwrap();
        assert_eq!(table.try_row(8, "k", LockMode::Shared), Err(7));
        table.release_all(7);
        assert!(table.is_empty());
    }

    #[test]
    fn predicate_locks_name_foreign_holders_only() {
        let mut table = LockTable::default();
        table.grant_predicate(4, "phantom");
        assert_eq!(table.predicate_holder(4, "phantom"), None);
        assert_eq!(table.predicate_holder(5, "phantom"), Some(4));
        table.release_all(4);
        assert_eq!(table.predicate_holder(5, "phantom"), None);
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let mut table = LockTable::default();
        table.try_row(1, "k", LockMode::Exclusive).unwrap();
        assert_eq!(table.queued_ahead(2, "k"), None);
        table.enqueue(2, "k");
        table.enqueue(3, "k");
        assert_eq!(table.queued_ahead(3, "k"), Some(2));
        assert_eq!(table.queued_ahead(2, "k"), None);
        // The holder itself is never held back by the queue.
        assert_eq!(table.queued_ahead(1, "k"), None);

        table.release_all(1);
        table.try_row(2, "k", LockMode::Exclusive).unwrap();
        table.dequeue(2, "k");
        assert_eq!(table.queued_ahead(3, "k"), None);
        table.dequeue(3, "k");
        table.release_all(2);
        assert!(table.is_empty());
    }
}
