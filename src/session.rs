use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::errors::{ProbeError, Result};
use crate::isolation::IsolationLevel;

/// One of the fixed statement shapes the harness issues against a target.
///
/// The scenario catalog never needs free-form SQL, so sessions receive typed
/// statements and SQL backends render them against their table layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Read the mutable text field of the row identified by `key`.
    ReadText { key: String },
    /// Overwrite the mutable text field of the row identified by `key`.
    UpdateText { key: String, value: String },
    /// Insert a new row carrying `marker` in its secondary field.
    InsertRow {
        key: String,
        text: String,
        marker: String,
    },
    /// Count rows whose secondary field equals `marker`.
    CountMarked { marker: String },
    /// Delete every row whose secondary field equals `marker`.
    DeleteMarked { marker: String },
    /// Delete the row identified by `key`, whatever it holds.
    DeleteKey { key: String },
    /// Set the text field of `key`, creating the row when it is missing.
    UpsertRow { key: String, text: String },
}

impl Statement {
    pub fn verb(&self) -> &'static str {
        match self {
            Statement::ReadText { .. } => "read",
            Statement::UpdateText { .. } => "update",
            Statement::InsertRow { .. } => "insert",
            Statement::CountMarked { .. } => "count",
            Statement::DeleteMarked { .. } | Statement::DeleteKey { .. } => "delete",
            Statement::UpsertRow { .. } => "upsert",
        }
    }
}

/// What a statement returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Text(Option<String>),
    Count(u64),
    Affected(usize),
}

impl Outcome {
    pub fn into_text(self) -> Result<Option<String>> {
        match self {
            Outcome::Text(text) => Ok(text),
            other => Err(ProbeError::Other(format!("expected text, got {other:?}"))),
        }
    }

    pub fn into_count(self) -> Result<u64> {
        match self {
            Outcome::Count(n) => Ok(n),
            other => Err(ProbeError::Other(format!("expected count, got {other:?}"))),
        }
    }

    pub fn into_affected(self) -> Result<usize> {
        match self {
            Outcome::Affected(n) => Ok(n),
            other => Err(ProbeError::Other(format!(
                "expected affected rows, got {other:?}"
            ))),
        }
    }
}

/// Aborts a session from a thread other than the one driving it.
pub trait Canceller: Send + Sync {
    fn cancel(&self);
}

/// A transactional connection to the store under test.
///
/// Autocommit is always off: nothing a session executes becomes visible to
/// others before [`Session::commit`]. The isolation level has to be set
/// before [`Session::begin`].
pub trait Session: Send {
    fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<()>;

    fn begin(&mut self) -> Result<()>;

    /// Executes one statement inside the open transaction. May block while
    /// the store waits for a conflicting lock.
    fn execute(&mut self, statement: &Statement) -> Result<Outcome>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Handle that aborts this session from another thread, if the backend
    /// supports it.
    fn canceller(&self) -> Option<Arc<dyn Canceller>>;
}

/// Produces fresh sessions for one target.
///
/// Implementations must be `Send` and `Sync`: every worker thread connects
/// through the same factory.
pub trait SessionFactory: Send + Sync {
    /// Identifier of the target, used in log lines and reports.
    fn target(&self) -> &str;

    fn connect(&self) -> Result<Box<dyn Session>>;
}

/// Opens sessions already bound to an isolation level and inside a
/// transaction.
#[derive(Clone)]
pub struct SessionProvider {
    factory: Arc<dyn SessionFactory>,
}

impl SessionProvider {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self { factory }
    }

    pub fn target(&self) -> &str {
        self.factory.target()
    }

    /// Connects, applies `level` and begins a transaction.
    ///
    /// The returned guard rolls back and closes the session when dropped, so
    /// every exit path releases the connection.
    pub fn open(&self, level: IsolationLevel) -> Result<SessionGuard> {
        let mut session = self.factory.connect()?;
        let prepared = session
            .set_isolation_level(level)
            .and_then(|_| session.begin());
        if let Err(err) = prepared {
            if let Err(close_err) = session.close() {
                debug!("close after failed begin: {close_err}");
            }
            return Err(err);
        }
        debug!("session opened on {} at {}", self.target(), level);
        Ok(SessionGuard {
            session,
            level,
            in_transaction: true,
            closed: false,
        })
    }
}

impl fmt::Debug for SessionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionProvider")
            .field("target", &self.target())
            .finish()
    }
}

/// Scoped ownership of an open session.
pub struct SessionGuard {
    session: Box<dyn Session>,
    level: IsolationLevel,
    in_transaction: bool,
    closed: bool,
}

impl SessionGuard {
    pub fn level(&self) -> IsolationLevel {
        self.level
    }

    pub fn execute(&mut self, statement: &Statement) -> Result<Outcome> {
        self.session.execute(statement)
    }

    pub fn canceller(&self) -> Option<Arc<dyn Canceller>> {
        self.session.canceller()
    }

    /// Commits and closes. On failure the drop path rolls back.
    pub fn commit(mut self) -> Result<()> {
        self.session.commit()?;
        self.in_transaction = false;
        self.finish()
    }

    pub fn rollback(mut self) -> Result<()> {
        self.in_transaction = false;
        self.session.rollback()?;
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        self.closed = true;
        self.session.close()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Err(err) = self.session.rollback() {
                debug!("rollback on drop failed: {err}");
            }
        }
        if !self.closed {
            if let Err(err) = self.session.close() {
                warn!("closing session failed: {err}");
            }
        }
    }
}

#[derive(Default)]
struct SlotState {
    canceller: Option<Arc<dyn Canceller>>,
    cancelled: bool,
}

/// Shared between the runner and one worker: the worker arms it with its
/// session's canceller, the runner fires it when the scenario overruns.
#[derive(Clone, Default)]
pub struct CancelSlot {
    state: Arc<Mutex<SlotState>>,
}

impl CancelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the canceller of a freshly opened session. Returns `false`
    /// when the slot has already fired, in which case the caller must give up.
    pub fn arm(&self, canceller: Option<Arc<dyn Canceller>>) -> bool {
        let mut state = self.state.lock();
        if state.cancelled {
            if let Some(canceller) = canceller {
                canceller.cancel();
            }
            return false;
        }
        state.canceller = canceller;
        true
    }

    pub fn disarm(&self) {
        self.state.lock().canceller = None;
    }

    pub fn cancel(&self) {
        let canceller = {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.canceller.take()
        };
        if let Some(canceller) = canceller {
            canceller.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Calls {
        rollbacks: AtomicUsize,
        closes: AtomicUsize,
        commits: AtomicUsize,
    }

    struct RecordingSession {
        calls: Arc<Calls>,
        fail_begin: bool,
    }

    impl Session for RecordingSession {
        fn set_isolation_level(&mut self, _level: IsolationLevel) -> Result<()> {
            Ok(())
        }

        fn begin(&mut self) -> Result<()> {
            if self.fail_begin {
                return Err(ProbeError::Statement("begin refused".into()));
            }
            Ok(())
        }

        fn execute(&mut self, _statement: &Statement) -> Result<Outcome> {
            Err(ProbeError::Statement("rejected".into()))
        }

        fn commit(&mut self) -> Result<()> {
            self.calls.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            self.calls.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.calls.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn canceller(&self) -> Option<Arc<dyn Canceller>> {
            None
        }
    }

    struct RecordingFactory {
        calls: Arc<Calls>,
        fail_begin: bool,
    }

    impl SessionFactory for RecordingFactory {
        fn target(&self) -> &str {
            "recording"
        }

        fn connect(&self) -> Result<Box<dyn Session>> {
            Ok(Box::new(RecordingSession {
                calls: Arc::clone(&self.calls),
                fail_begin: self.fail_begin,
            }))
        }
    }

    fn provider(fail_begin: bool) -> (SessionProvider, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let factory = RecordingFactory {
            calls: Arc::clone(&calls),
            fail_begin,
        };
        (SessionProvider::new(Arc::new(factory)), calls)
    }

    #[test]
    fn dropped_guard_rolls_back_and_closes() {
        let (provider, calls) = provider(false);
        {
            let mut guard = provider.open(IsolationLevel::ReadCommitted).unwrap();
            let err = guard
                .execute(&Statement::CountMarked {
                    marker: "m".into(),
                })
                .unwrap_err();
            assert!(matches!(err, ProbeError::Statement(_)));
        }
        assert_eq!(calls.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn committed_guard_closes_once() {
        let (provider, calls) = provider(false);
        let guard = provider.open(IsolationLevel::Serializable).unwrap();
        guard.commit().unwrap();
        assert_eq!(calls.commits.load(Ordering::SeqCst), 1);
        assert_eq!(calls.rollbacks.load(Ordering::SeqCst), 0);
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_begin_closes_session() {
        let (provider, calls) = provider(true);
        assert!(provider.open(IsolationLevel::ReadCommitted).is_err());
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_slot_fires_late_arming() {
        struct Flag(AtomicUsize);
        impl Canceller for Flag {
            fn cancel(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let slot = CancelSlot::new();
        slot.cancel();
        let flag = Arc::new(Flag(AtomicUsize::new(0)));
        assert!(!slot.arm(Some(flag.clone())));
        assert_eq!(flag.0.load(Ordering::SeqCst), 1);
        assert!(slot.is_cancelled());
    }
}
