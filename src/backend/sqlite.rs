//! SQLite target over `rusqlite`.
//!
//! Every session opens its own connection to the database file, so the probe
//! exercises SQLite's real file locking. SQLite has a single native isolation
//! behaviour; the requested level only toggles `read_uncommitted`, which has
//! an effect for shared-cache connections. The matrix reports whatever the
//! engine actually does.
//!
//! SQLite's own busy handler is switched off. Sessions retry busy statements
//! themselves in short slices, so a cancelled session stops waiting for a
//! lock within one slice.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};
use rusqlite::{
    Connection, ErrorCode, InterruptHandle, OpenFlags, OptionalExtension, ffi, params_from_iter,
};

use crate::config::TableSchema;
use crate::errors::{ProbeError, Result};
use crate::isolation::IsolationLevel;
use crate::session::{Canceller, Outcome, Session, SessionFactory, Statement};

/// A statement rendered to SQL text plus positional parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub sql: String,
    pub params: Vec<String>,
}

/// Renders `statement` against the configured table layout. Identifiers are
/// validated by [`TableSchema::validate`] and quoted here.
pub fn render(schema: &TableSchema, statement: &Statement) -> Rendered {
    let table = quote(&schema.table);
    let key = quote(&schema.key_column);
    let text = quote(&schema.text_column);
    let marker = quote(&schema.marker_column);

    let (sql, params) = match statement {
        Statement::ReadText { key: k } => (
            format!("SELECT {text} FROM {table} WHERE {key} = ?1"),
            vec![k.clone()],
        ),
        Statement::UpdateText { key: k, value } => (
            format!("UPDATE {table} SET {text} = ?1 WHERE {key} = ?2"),
            vec![value.clone(), k.clone()],
        ),
        Statement::InsertRow {
            key: k,
            text: t,
            marker: m,
        } => (
            format!("INSERT INTO {table} ({key}, {text}, {marker}) VALUES (?1, ?2, ?3)"),
            vec![k.clone(), t.clone(), m.clone()],
        ),
        Statement::CountMarked { marker: m } => (
            format!("SELECT COUNT(*) FROM {table} WHERE {marker} = ?1"),
            vec![m.clone()],
        ),
        Statement::DeleteMarked { marker: m } => (
            format!("DELETE FROM {table} WHERE {marker} = ?1"),
            vec![m.clone()],
        ),
        Statement::DeleteKey { key: k } => (
            format!("DELETE FROM {table} WHERE {key} = ?1"),
            vec![k.clone()],
        ),
        Statement::UpsertRow { key: k, text: t } => (
            format!(
                "INSERT INTO {table} ({key}, {text}) VALUES (?1, ?2) \
                 ON CONFLICT({key}) DO UPDATE SET {text} = excluded.{text}"
            ),
            vec![k.clone(), t.clone()],
        ),
    };
    Rendered { sql, params }
}

fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

pub struct SqliteFactory {
    path: PathBuf,
    schema: Arc<TableSchema>,
    lock_wait_timeout: Duration,
    name: String,
}

impl SqliteFactory {
    pub fn new(
        path: impl Into<PathBuf>,
        schema: TableSchema,
        lock_wait_timeout: Duration,
        name: impl Into<String>,
    ) -> Result<Self> {
        schema.validate()?;
        Ok(Self {
            path: path.into(),
            schema: Arc::new(schema),
            lock_wait_timeout,
            name: name.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Switches the database to WAL mode and, when asked, creates the probe
    /// table with an index on the marker column.
    pub fn prepare(&self, create_schema: bool) -> Result<()> {
        let conn = self.open(OpenFlags::default())?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("{} journal mode: {mode}", self.name);
        if create_schema {
            let table = quote(&self.schema.table);
            let key = quote(&self.schema.key_column);
            let text = quote(&self.schema.text_column);
            let marker = quote(&self.schema.marker_column);
            let index = quote(&format!(
                "{}_{}_idx",
                self.schema.table, self.schema.marker_column
            ));
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                     {key} TEXT PRIMARY KEY NOT NULL, \
                     {text} TEXT, \
                     {marker} TEXT); \
                 CREATE INDEX IF NOT EXISTS {index} ON {table} ({marker});"
            ))?;
            info!("schema ready in {}", self.path.display());
        }
        Ok(())
    }

    fn open(&self, flags: OpenFlags) -> Result<Connection> {
        let conn = Connection::open_with_flags(&self.path, flags).map_err(|err| {
            ProbeError::Connection(format!("cannot open {}: {err}", self.path.display()))
        })?;
        conn.busy_timeout(Duration::ZERO)
            .map_err(|err| ProbeError::Connection(err.to_string()))?;
        Ok(conn)
    }
}

impl SessionFactory for SqliteFactory {
    fn target(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<Box<dyn Session>> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = self.open(flags)?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Box::new(SqliteSession {
            conn: Some(conn),
            schema: Arc::clone(&self.schema),
            level: IsolationLevel::Serializable,
            lock_wait_timeout: self.lock_wait_timeout,
            interrupt,
            cancelled: Arc::new(AtomicBool::new(false)),
        }))
    }
}

const BUSY_SLICE: Duration = Duration::from_millis(10);

pub struct SqliteSession {
    conn: Option<Connection>,
    schema: Arc<TableSchema>,
    level: IsolationLevel,
    lock_wait_timeout: Duration,
    interrupt: Arc<InterruptHandle>,
    cancelled: Arc<AtomicBool>,
}

impl SqliteSession {
    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| ProbeError::Connection("session is closed".into()))
    }

    /// Runs `op` until it gets past SQLite's locks, the lock wait timeout
    /// runs out, or the session is cancelled.
    fn retry_busy<T>(&self, mut op: impl FnMut(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn()?;
        let deadline = Instant::now() + self.lock_wait_timeout;
        loop {
            let err = match op(conn) {
                Err(err) if is_busy(&err) => err,
                other => return other.map_err(ProbeError::from),
            };
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(ProbeError::Statement(format!(
                    "cancelled while waiting for a lock: {err}"
                )));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ProbeError::Statement(format!(
                    "lock wait timeout exceeded after {} ms: {err}",
                    self.lock_wait_timeout.as_millis()
                )));
            }
            thread::sleep(BUSY_SLICE.min(deadline - now));
        }
    }

    fn in_transaction(&self) -> bool {
        self.conn.as_ref().is_some_and(|conn| !conn.is_autocommit())
    }
}

impl Session for SqliteSession {
    fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<()> {
        if self.in_transaction() {
            return Err(ProbeError::Statement(
                "isolation level cannot change inside a transaction".into(),
            ));
        }
        let dirty = level == IsolationLevel::ReadUncommitted;
        self.conn()?
            .pragma_update(None, "read_uncommitted", dirty)?;
        self.level = level;
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        self.conn()?.execute_batch("BEGIN DEFERRED")?;
        Ok(())
    }

    fn execute(&mut self, statement: &Statement) -> Result<Outcome> {
        if !self.in_transaction() {
            return Err(ProbeError::Statement("no transaction in progress".into()));
        }
        let rendered = render(&self.schema, statement);
        let sql = rendered.sql.as_str();
        self.retry_busy(|conn| {
            let params = params_from_iter(rendered.params.iter());
            match statement {
                Statement::ReadText { .. } => {
                    let text: Option<Option<String>> = conn
                        .query_row(sql, params, |row| row.get(0))
                        .optional()?;
                    Ok(Outcome::Text(text.flatten()))
                }
                Statement::CountMarked { .. } => {
                    let count: i64 = conn.query_row(sql, params, |row| row.get(0))?;
                    Ok(Outcome::Count(count.max(0) as u64))
                }
                _ => Ok(Outcome::Affected(conn.execute(sql, params)?)),
            }
        })
    }

    fn commit(&mut self) -> Result<()> {
        self.retry_busy(|conn| conn.execute_batch("COMMIT"))
    }

    fn rollback(&mut self) -> Result<()> {
        // An interrupted or failed statement may already have ended it.
        if self.in_transaction() {
            self.conn()?.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.rollback()?;
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, err)| ProbeError::from(err))?;
        }
        Ok(())
    }

    fn canceller(&self) -> Option<Arc<dyn Canceller>> {
        Some(Arc::new(SqliteCanceller {
            interrupt: Arc::clone(&self.interrupt),
            cancelled: Arc::clone(&self.cancelled),
        }))
    }
}

/// Locked out by another connection. A stale WAL snapshot also reports busy
/// but never clears by waiting, so it is not retried.
fn is_busy(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
                && failure.extended_code != ffi::SQLITE_BUSY_SNAPSHOT
        }
        _ => false,
    }
}

struct SqliteCanceller {
    interrupt: Arc<InterruptHandle>,
    cancelled: Arc<AtomicBool>,
}

impl Canceller for SqliteCanceller {
    /// Stops a lock wait through the flag and a running statement through
    /// SQLite's interrupt.
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.interrupt.interrupt();
    }
}
