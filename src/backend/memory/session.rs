use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use super::MemoryEngine;
use crate::errors::{ProbeError, Result};
use crate::isolation::IsolationLevel;
use crate::session::{Canceller, Outcome, Session, SessionFactory, Statement};

/// Connects sessions to a shared [`MemoryEngine`].
pub struct MemoryFactory {
    engine: Arc<MemoryEngine>,
    name: String,
}

impl MemoryFactory {
    pub fn new(engine: Arc<MemoryEngine>, name: impl Into<String>) -> Self {
        Self {
            engine,
            name: name.into(),
        }
    }

    pub fn engine(&self) -> &Arc<MemoryEngine> {
        &self.engine
    }
}

impl SessionFactory for MemoryFactory {
    fn target(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<Box<dyn Session>> {
        if !self.engine.is_available() {
            return Err(ProbeError::Connection(format!(
                "target '{}' is not accepting connections",
                self.name
            )));
        }
        Ok(Box::new(MemorySession::new(Arc::clone(&self.engine))))
    }
}

/// A connection to the reference engine.
pub struct MemorySession {
    engine: Arc<MemoryEngine>,
    level: IsolationLevel,
    /// Active transaction id, shared with the canceller.
    current: Arc<Mutex<Option<u64>>>,
    closed: bool,
}

impl MemorySession {
    pub fn new(engine: Arc<MemoryEngine>) -> Self {
        Self {
            engine,
            level: IsolationLevel::ReadCommitted,
            current: Arc::new(Mutex::new(None)),
            closed: false,
        }
    }

    fn active(&self) -> Result<u64> {
        if self.closed {
            return Err(ProbeError::Connection("session is closed".into()));
        }
        (*self.current.lock())
            .ok_or_else(|| ProbeError::Statement("no transaction in progress".into()))
    }
}

impl Session for MemorySession {
    fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<()> {
        if self.current.lock().is_some() {
            return Err(ProbeError::Statement(
                "isolation level cannot change inside a transaction".into(),
            ));
        }
        self.level = level;
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        if self.closed {
            return Err(ProbeError::Connection("session is closed".into()));
        }
        let mut current = self.current.lock();
        if current.is_some() {
            return Err(ProbeError::Statement(
                "a transaction is already in progress".into(),
            ));
        }
        *current = Some(self.engine.begin(self.level));
        Ok(())
    }

    fn execute(&mut self, statement: &Statement) -> Result<Outcome> {
        let txn = self.active()?;
        self.engine.execute(txn, statement)
    }

    fn commit(&mut self) -> Result<()> {
        let txn = self.active()?;
        let result = self.engine.commit(txn);
        *self.current.lock() = None;
        result
    }

    fn rollback(&mut self) -> Result<()> {
        if let Some(txn) = self.current.lock().take() {
            self.engine.rollback(txn);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.rollback()?;
        self.closed = true;
        Ok(())
    }

    fn canceller(&self) -> Option<Arc<dyn Canceller>> {
        Some(Arc::new(MemoryCanceller {
            engine: Arc::clone(&self.engine),
            current: Arc::clone(&self.current),
        }))
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if let Some(txn) = self.current.lock().take() {
            debug!("memory session dropped with txn {txn} open, rolling back");
            self.engine.rollback(txn);
        }
    }
}

struct MemoryCanceller {
    engine: Arc<MemoryEngine>,
    current: Arc<Mutex<Option<u64>>>,
}

impl Canceller for MemoryCanceller {
    fn cancel(&self) {
        // Leave the id in place: the owning session still has to roll back.
        let txn = *self.current.lock();
        if let Some(txn) = txn {
            self.engine.abort(txn, "cancelled by runner");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::RowImage;
    use std::thread;
    use std::time::{Duration, Instant};

    fn factory(wait: Duration) -> MemoryFactory {
        let engine = Arc::new(MemoryEngine::new(wait));
        engine.seed("row", RowImage::new("base", None));
        MemoryFactory::new(engine, "memory-test")
    }

    fn update(value: &str) -> Statement {
        Statement::UpdateText {
            key: "row".into(),
            value: value.into(),
        }
    }

    #[test]
    fn unavailable_engine_refuses_connections() {
        let factory = factory(Duration::from_millis(50));
        factory.engine().set_available(false);
        let err = factory.connect().err().unwrap();
        assert!(matches!(err, ProbeError::Connection(_)));
        factory.engine().set_available(true);
        assert!(factory.connect().is_ok());
    }

    #[test]
    fn level_is_fixed_inside_transaction() {
        let factory = factory(Duration::from_millis(50));
        let mut session = factory.connect().unwrap();
        assert!(session.execute(&update("x")).is_err());
        session.set_isolation_level(IsolationLevel::Serializable).unwrap();
        session.begin().unwrap();
        assert!(session.set_isolation_level(IsolationLevel::ReadCommitted).is_err());
        assert!(session.begin().is_err());
        session.rollback().unwrap();
        session.close().unwrap();
        assert!(session.begin().is_err());
    }

    #[test]
    fn dropping_session_releases_locks() {
        let factory = factory(Duration::from_millis(50));
        {
            let mut session = factory.connect().unwrap();
            session.set_isolation_level(IsolationLevel::ReadCommitted).unwrap();
            session.begin().unwrap();
            session.execute(&update("held")).unwrap();
            assert!(factory.engine().holds_locks());
        }
        assert!(!factory.engine().holds_locks());
        assert_eq!(factory.engine().active_transactions(), 0);
        assert_eq!(factory.engine().committed_text("row").as_deref(), Some("base"));
    }

    #[test]
    fn cancel_unblocks_lock_wait() {
        let factory = factory(Duration::from_secs(10));
        let mut holder = factory.connect().unwrap();
        holder.set_isolation_level(IsolationLevel::ReadCommitted).unwrap();
        holder.begin().unwrap();
        holder.execute(&update("holder")).unwrap();

        let mut waiter = factory.connect().unwrap();
        waiter.set_isolation_level(IsolationLevel::ReadCommitted).unwrap();
        waiter.begin().unwrap();
        let canceller = waiter.canceller().unwrap();

        let handle = thread::spawn(move || {
            let started = Instant::now();
            let result = waiter.execute(&update("waiter"));
            (result, started.elapsed())
        });
        thread::sleep(Duration::from_millis(50));
        canceller.cancel();
        let (result, waited) = handle.join().unwrap();
        assert!(matches!(result, Err(ProbeError::Statement(_))));
        assert!(waited < Duration::from_secs(5));

        holder.commit().unwrap();
        assert_eq!(factory.engine().committed_text("row").as_deref(), Some("holder"));
    }
}
