//! In-process reference engine.
//!
//! A small multi-version row store that implements the textbook, lock-based
//! reading of the four isolation levels:
//!
//! - read-uncommitted: reads see other transactions' uncommitted writes and
//!   writes take no locks, so concurrent writers never wait for each other.
//! - read-committed: reads see the latest committed version; writes hold an
//!   exclusive row lock until the transaction ends.
//! - repeatable-read: the first read of a row pins that snapshot for the rest
//!   of the transaction. Range counts are evaluated afresh, so rows inserted
//!   by others show up as phantoms.
//! - serializable: strict two-phase locking. Reads take shared row locks,
//!   range counts take predicate locks, and inserts into a locked range wait.
//!
//! Waiters for the same row or range are served in arrival order. Lock waits
//! give up after the configured lock-wait timeout with a statement error, the
//! way a server reports "lock wait timeout exceeded".

mod locks;
mod session;
mod versioned;

pub use locks::LockMode;
pub use session::{MemoryFactory, MemorySession};
pub use versioned::{RowHistory, RowImage, VersionedRow};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::errors::{ProbeError, Result};
use crate::isolation::IsolationLevel;
use crate::session::{Outcome, Statement};
use locks::LockTable;

#[derive(Debug, Clone)]
struct PendingWrite {
    /// `None` stages a delete.
    image: Option<Arc<RowImage>>,
    /// Engine-wide write order, used to pick the newest dirty image.
    seq: u64,
}

#[derive(Debug)]
struct TxnState {
    level: IsolationLevel,
    pending: HashMap<String, PendingWrite>,
    /// Engine clock at the first read of each row by a repeatable-read or
    /// serializable transaction.
    pinned: HashMap<String, u64>,
    aborted: Option<String>,
}

#[derive(Debug, Default)]
struct EngineState {
    rows: HashMap<String, RowHistory>,
    locks: LockTable,
    txns: HashMap<u64, TxnState>,
    clock: u64,
    write_seq: u64,
}

impl EngineState {
    fn txn(&self, txn: u64) -> Result<&TxnState> {
        let state = self.txns.get(&txn).ok_or_else(|| {
            ProbeError::Statement(format!("transaction {txn} is not active"))
        })?;
        if let Some(reason) = &state.aborted {
            return Err(ProbeError::Statement(format!(
                "transaction {txn} was aborted: {reason}"
            )));
        }
        Ok(state)
    }

    fn txn_mut(&mut self, txn: u64) -> Result<&mut TxnState> {
        self.txn(txn)?;
        self.txns
            .get_mut(&txn)
            .ok_or_else(|| ProbeError::Statement(format!("transaction {txn} is not active")))
    }

    fn committed(&self, key: &str) -> Option<Arc<RowImage>> {
        self.rows.get(key).and_then(|history| history.current().cloned())
    }

    /// Newest uncommitted write to `key` by a transaction other than `txn`.
    fn foreign_dirty(&self, txn: u64, key: &str) -> Option<Option<Arc<RowImage>>> {
        self.txns
            .iter()
            .filter(|(id, state)| **id != txn && state.aborted.is_none())
            .filter_map(|(_, state)| state.pending.get(key))
            .max_by_key(|write| write.seq)
            .map(|write| write.image.clone())
    }

    /// The row as a read by `txn` would return it.
    fn visible(&self, txn: u64, key: &str) -> Option<Arc<RowImage>> {
        let Some(state) = self.txns.get(&txn) else {
            return None;
        };
        if let Some(write) = state.pending.get(key) {
            return write.image.clone();
        }
        match state.level {
            IsolationLevel::ReadUncommitted => self
                .foreign_dirty(txn, key)
                .unwrap_or_else(|| self.committed(key)),
            IsolationLevel::ReadCommitted => self.committed(key),
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => {
                match state.pinned.get(key) {
                    Some(&snapshot) => self
                        .rows
                        .get(key)
                        .and_then(|history| history.as_of(snapshot).cloned()),
                    None => self.committed(key),
                }
            }
        }
    }

    /// The row a write by `txn` would overwrite.
    fn writable(&self, txn: u64, key: &str) -> Option<Arc<RowImage>> {
        match self.txns.get(&txn).and_then(|state| state.pending.get(key)) {
            Some(write) => write.image.clone(),
            None => self.committed(key),
        }
    }

    fn keys(&self) -> HashSet<String> {
        let mut keys: HashSet<String> = self.rows.keys().cloned().collect();
        for state in self.txns.values() {
            keys.extend(state.pending.keys().cloned());
        }
        keys
    }

    /// Another transaction with an uncommitted write touching the `marker`
    /// range, either by writing such a row or by changing one.
    fn range_writer(&self, txn: u64, marker: &str) -> Option<u64> {
        self.txns
            .iter()
            .filter(|(id, state)| **id != txn && state.aborted.is_none())
            .find(|(_, state)| {
                state.pending.iter().any(|(key, write)| {
                    write.image.as_ref().is_some_and(|img| img.has_marker(marker))
                        || self.committed(key).is_some_and(|img| img.has_marker(marker))
                })
            })
            .map(|(id, _)| *id)
    }

    fn stage(&mut self, txn: u64, key: &str, image: Option<RowImage>) -> Result<()> {
        self.write_seq += 1;
        let seq = self.write_seq;
        self.txn_mut(txn)?.pending.insert(
            key.to_string(),
            PendingWrite {
                image: image.map(Arc::new),
                seq,
            },
        );
        Ok(())
    }
}

/// The reference engine. Share it through an `Arc` and hand out sessions
/// with [`MemoryFactory`].
pub struct MemoryEngine {
    state: Mutex<EngineState>,
    released: Condvar,
    next_txn: AtomicU64,
    lock_wait_timeout: Duration,
    available: AtomicBool,
}

impl MemoryEngine {
    pub fn new(lock_wait_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            released: Condvar::new(),
            next_txn: AtomicU64::new(0),
            lock_wait_timeout,
            available: AtomicBool::new(true),
        }
    }

    /// While unavailable, connecting fails with a connection error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Commits a row directly, outside any transaction.
    pub fn seed(&self, key: &str, image: RowImage) {
        let mut state = self.state.lock();
        state.clock += 1;
        let version = state.clock;
        state
            .rows
            .entry(key.to_string())
            .or_default()
            .push(VersionedRow::new(Some(Arc::new(image)), version));
    }

    pub fn committed_text(&self, key: &str) -> Option<String> {
        self.state.lock().committed(key).map(|img| img.text.clone())
    }

    pub fn committed_marked(&self, marker: &str) -> u64 {
        let state = self.state.lock();
        state
            .rows
            .values()
            .filter_map(RowHistory::current)
            .filter(|img| img.has_marker(marker))
            .count() as u64
    }

    pub fn active_transactions(&self) -> usize {
        self.state.lock().txns.len()
    }

    pub fn holds_locks(&self) -> bool {
        !self.state.lock().locks.is_empty()
    }

    pub(crate) fn begin(&self, level: IsolationLevel) -> u64 {
        let txn = self.next_txn.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.lock().txns.insert(
            txn,
            TxnState {
                level,
                pending: HashMap::new(),
                pinned: HashMap::new(),
                aborted: None,
            },
        );
        trace!("memory txn {txn} began at {level}");
        txn
    }

    pub(crate) fn execute(&self, txn: u64, statement: &Statement) -> Result<Outcome> {
        let mut guard = self.state.lock();
        let level = guard.txn(txn)?.level;
        let locking = level != IsolationLevel::ReadUncommitted;

        match statement {
            Statement::ReadText { key } => {
                if level == IsolationLevel::Serializable {
                    self.acquire(&mut guard, txn, key, |s| {
                        s.locks.try_row(txn, key, LockMode::Shared)
                    })?;
                }
                let image = guard.visible(txn, key);
                let snapshot = guard.clock;
                let state = guard.txn_mut(txn)?;
                if matches!(
                    level,
                    IsolationLevel::RepeatableRead | IsolationLevel::Serializable
                ) && !state.pending.contains_key(key)
                {
                    state.pinned.entry(key.clone()).or_insert(snapshot);
                }
                Ok(Outcome::Text(image.map(|img| img.text.clone())))
            }
            Statement::CountMarked { marker } => {
                if level == IsolationLevel::Serializable {
                    self.acquire(&mut guard, txn, marker, |s| {
                        if let Some(writer) = s.range_writer(txn, marker) {
                            return Err(writer);
                        }
                        s.locks.grant_predicate(txn, marker);
                        Ok(())
                    })?;
                }
                let count = guard
                    .keys()
                    .iter()
                    .filter(|key| {
                        guard
                            .visible(txn, key)
                            .is_some_and(|img| img.has_marker(marker))
                    })
                    .count();
                Ok(Outcome::Count(count as u64))
            }
            Statement::UpdateText { key, value } => {
                if locking {
                    self.acquire(&mut guard, txn, key, |s| {
                        s.locks.try_row(txn, key, LockMode::Exclusive)
                    })?;
                }
                match guard.writable(txn, key) {
                    None => Ok(Outcome::Affected(0)),
                    Some(current) => {
                        let image = RowImage::new(value.clone(), current.marker.clone());
                        guard.stage(txn, key, Some(image))?;
                        Ok(Outcome::Affected(1))
                    }
                }
            }
            Statement::InsertRow { key, text, marker } => {
                if locking {
                    self.acquire(&mut guard, txn, key, |s| {
                        if let Some(holder) = s.locks.predicate_holder(txn, marker) {
                            return Err(holder);
                        }
                        s.locks.try_row(txn, key, LockMode::Exclusive)
                    })?;
                }
                if guard.writable(txn, key).is_some() {
                    return Err(ProbeError::Statement(format!("duplicate key '{key}'")));
                }
                let image = RowImage::new(text.clone(), Some(marker.clone()));
                guard.stage(txn, key, Some(image))?;
                Ok(Outcome::Affected(1))
            }
            Statement::DeleteMarked { marker } => {
                let mut keys: Vec<String> = guard
                    .keys()
                    .into_iter()
                    .filter(|key| {
                        guard
                            .writable(txn, key)
                            .is_some_and(|img| img.has_marker(marker))
                    })
                    .collect();
                keys.sort();
                let mut deleted = 0;
                for key in keys {
                    if locking {
                        self.acquire(&mut guard, txn, &key, |s| {
                            s.locks.try_row(txn, &key, LockMode::Exclusive)
                        })?;
                    }
                    // Re-check: the row may have changed while we waited.
                    if guard
                        .writable(txn, &key)
                        .is_some_and(|img| img.has_marker(marker))
                    {
                        guard.stage(txn, &key, None)?;
                        deleted += 1;
                    }
                }
                Ok(Outcome::Affected(deleted))
            }
            Statement::DeleteKey { key } => {
                if locking {
                    self.acquire(&mut guard, txn, key, |s| {
                        s.locks.try_row(txn, key, LockMode::Exclusive)
                    })?;
                }
                if guard.writable(txn, key).is_none() {
                    return Ok(Outcome::Affected(0));
                }
                guard.stage(txn, key, None)?;
                Ok(Outcome::Affected(1))
            }
            Statement::UpsertRow { key, text } => {
                if locking {
                    self.acquire(&mut guard, txn, key, |s| {
                        s.locks.try_row(txn, key, LockMode::Exclusive)
                    })?;
                }
                let marker = guard
                    .writable(txn, key)
                    .and_then(|img| img.marker.clone());
                guard.stage(txn, key, Some(RowImage::new(text.clone(), marker)))?;
                Ok(Outcome::Affected(1))
            }
        }
    }

    pub(crate) fn commit(&self, txn: u64) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard
            .txns
            .remove(&txn)
            .ok_or_else(|| ProbeError::Statement(format!("transaction {txn} is not active")))?;
        guard.locks.release_all(txn);
        if let Some(reason) = state.aborted {
            drop(guard);
            self.released.notify_all();
            return Err(ProbeError::Statement(format!(
                "transaction {txn} was aborted: {reason}"
            )));
        }
        guard.clock += 1;
        let version = guard.clock;
        let written: Vec<String> = state.pending.keys().cloned().collect();
        for (key, write) in state.pending {
            guard
                .rows
                .entry(key)
                .or_default()
                .push(VersionedRow::new(write.image, version));
        }
        // Keep only what the oldest open snapshot can still read.
        let horizon = guard
            .txns
            .values()
            .flat_map(|other| other.pinned.values().copied())
            .min()
            .unwrap_or(version);
        for key in &written {
            if let Some(history) = guard.rows.get_mut(key) {
                history.prune(horizon);
            }
        }
        let written = written.len();
        drop(guard);
        self.released.notify_all();
        debug!("memory txn {txn} committed {written} write(s) at version {version}");
        Ok(())
    }

    pub(crate) fn rollback(&self, txn: u64) {
        let mut guard = self.state.lock();
        guard.txns.remove(&txn);
        guard.locks.release_all(txn);
        drop(guard);
        self.released.notify_all();
        trace!("memory txn {txn} rolled back");
    }

    /// Forcibly ends `txn` from another thread: staged writes are discarded,
    /// locks released, and every later call on the transaction fails.
    pub(crate) fn abort(&self, txn: u64, reason: &str) {
        let mut guard = self.state.lock();
        if let Some(state) = guard.txns.get_mut(&txn) {
            if state.aborted.is_none() {
                state.pending.clear();
                state.pinned.clear();
                state.aborted = Some(reason.to_string());
            }
        }
        guard.locks.release_all(txn);
        drop(guard);
        self.released.notify_all();
        debug!("memory txn {txn} aborted: {reason}");
    }

    /// Retries `grant` until it succeeds, the transaction is aborted, or the
    /// lock-wait timeout expires. While waiting, `txn` sits in the queue of
    /// `what` and only tries once everyone ahead of it got through.
    fn acquire<F>(
        &self,
        guard: &mut MutexGuard<'_, EngineState>,
        txn: u64,
        what: &str,
        mut grant: F,
    ) -> Result<()>
    where
        F: FnMut(&mut EngineState) -> std::result::Result<(), u64>,
    {
        let deadline = Instant::now() + self.lock_wait_timeout;
        let mut queued = false;
        let mut timed_out = false;
        let result = loop {
            if let Err(err) = guard.txn(txn) {
                break Err(err);
            }
            let blocker = match guard.locks.queued_ahead(txn, what) {
                Some(ahead) => ahead,
                None => match grant(&mut **guard) {
                    Ok(()) => break Ok(()),
                    Err(holder) => holder,
                },
            };
            if timed_out {
                break Err(ProbeError::Statement(format!(
                    "lock wait timeout exceeded: txn {txn} waited on txn {blocker} for '{what}'"
                )));
            }
            if !queued {
                guard.locks.enqueue(txn, what);
                queued = true;
            }
            trace!("memory txn {txn} waits on txn {blocker} for '{what}'");
            timed_out = self.released.wait_until(guard, deadline).timed_out();
        };
        if queued {
            guard.locks.dequeue(txn, what);
            self.released.notify_all();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MemoryEngine {
        let engine = MemoryEngine::new(Duration::from_millis(100));
        engine.seed("row", RowImage::new("base", None));
        engine
    }

    fn read(engine: &MemoryEngine, txn: u64) -> Option<String> {
        engine
            .execute(txn, &Statement::ReadText { key: "row".into() })
            .unwrap()
            .into_text()
            .unwrap()
    }

    fn update(engine: &MemoryEngine, txn: u64, value: &str) -> Result<Outcome> {
        engine.execute(
            txn,
            &Statement::UpdateText {
                key: "row".into(),
                value: value.into(),
            },
        )
    }

    #[test]
    fn read_uncommitted_sees_dirty_writes() {
        let engine = engine();
        let writer = engine.begin(IsolationLevel::ReadUncommitted);
        let reader = engine.begin(IsolationLevel::ReadUncommitted);
        update(&engine, writer, "dirty").unwrap();
        assert_eq!(read(&engine, reader).as_deref(), Some("dirty"));
        engine.rollback(writer);
        assert_eq!(read(&engine, reader).as_deref(), Some("base"));
    }

    #[test]
    fn read_committed_ignores_dirty_writes() {
        let engine = engine();
        let writer = engine.begin(IsolationLevel::ReadCommitted);
        let reader = engine.begin(IsolationLevel::ReadCommitted);
        update(&engine, writer, "new").unwrap();
        assert_eq!(read(&engine, reader).as_deref(), Some("base"));
        engine.commit(writer).unwrap();
        assert_eq!(read(&engine, reader).as_deref(), Some("new"));
    }

    #[test]
    fn repeatable_read_pins_first_read() {
        let engine = engine();
        let reader = engine.begin(IsolationLevel::RepeatableRead);
        assert_eq!(read(&engine, reader).as_deref(), Some("base"));
        let writer = engine.begin(IsolationLevel::RepeatableRead);
        update(&engine, writer, "new").unwrap();
        engine.commit(writer).unwrap();
        assert_eq!(read(&engine, reader).as_deref(), Some("base"));
        engine.commit(reader).unwrap();
        assert_eq!(engine.committed_text("row").as_deref(), Some("new"));
    }

    #[test]
    fn serializable_read_blocks_writer_until_timeout() {
        let engine = engine();
        let reader = engine.begin(IsolationLevel::Serializable);
        read(&engine, reader);
        let writer = engine.begin(IsolationLevel::Serializable);
        let err = update(&engine, writer, "new").unwrap_err();
        assert!(err.to_string().contains("lock wait timeout"));
        engine.rollback(writer);
        engine.commit(reader).unwrap();
        assert!(!engine.holds_locks());
    }

    #[test]
    fn write_locks_depend_on_level() {
        let engine = engine();
        let a = engine.begin(IsolationLevel::ReadUncommitted);
        let b = engine.begin(IsolationLevel::ReadUncommitted);
        update(&engine, a, "a").unwrap();
        update(&engine, b, "b").unwrap();
        engine.commit(a).unwrap();
        engine.commit(b).unwrap();
        assert_eq!(engine.committed_text("row").as_deref(), Some("b"));

        let c = engine.begin(IsolationLevel::ReadCommitted);
        let d = engine.begin(IsolationLevel::ReadCommitted);
        update(&engine, c, "c").unwrap();
        assert!(update(&engine, d, "d").is_err());
    }

    #[test]
    fn repeatable_read_sees_phantoms_serializable_does_not() {
        let engine = engine();
        engine.seed("seed", RowImage::new("x", Some("m".into())));
        let count = |txn| {
            engine
                .execute(txn, &Statement::CountMarked { marker: "m".into() })
                .unwrap()
                .into_count()
                .unwrap()
        };
        let insert = |txn, key: &str| {
            engine.execute(
                txn,
                &Statement::InsertRow {
                    key: key.into(),
                    text: "y".into(),
                    marker: "m".into(),
                },
            )
        };

        let rr = engine.begin(IsolationLevel::RepeatableRead);
        assert_eq!(count(rr), 1);
        let w = engine.begin(IsolationLevel::RepeatableRead);
        insert(w, "p1").unwrap();
        engine.commit(w).unwrap();
        assert_eq!(count(rr), 2);
        engine.commit(rr).unwrap();

        let ser = engine.begin(IsolationLevel::Serializable);
        assert_eq!(count(ser), 2);
        let w = engine.begin(IsolationLevel::Serializable);
        assert!(insert(w, "p2").is_err());
        engine.rollback(w);
        assert_eq!(count(ser), 2);
        engine.commit(ser).unwrap();
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let engine = engine();
        let txn = engine.begin(IsolationLevel::ReadCommitted);
        let err = engine
            .execute(
                txn,
                &Statement::InsertRow {
                    key: "row".into(),
                    text: "t".into(),
                    marker: "m".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, ProbeError::Statement(_)));
    }

    #[test]
    fn aborted_transaction_fails_afterwards() {
        let engine = engine();
        let txn = engine.begin(IsolationLevel::ReadCommitted);
        update(&engine, txn, "lost").unwrap();
        engine.abort(txn, "cancelled by runner");
        assert!(update(&engine, txn, "again").is_err());
        assert!(engine.commit(txn).is_err());
        assert_eq!(engine.committed_text("row").as_deref(), Some("base"));
        assert!(!engine.holds_locks());
        assert_eq!(engine.active_transactions(), 0);
    }
}
