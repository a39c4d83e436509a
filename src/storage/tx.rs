//! Transactions.
//!
//! A transaction runs as one unit on the storage worker. Every mutating
//! statement records its target table; only once the commit has succeeded
//! are the recorded tables handed to the caches for invalidation. A
//! rollback invalidates nothing.
//!
//! A transaction started while another is already open on the worker (a
//! nested call made from inside the outer closure) becomes a savepoint. Its
//! touched tables are folded into the enclosing transaction and invalidated
//! when that one commits.

use crate::cache::TouchedTables;
use crate::error::Result;
use crate::storage::param::Param;
use crate::storage::row::RowMapper;
use crate::storage::{execute_statement, query_first, query_rows};
use rusqlite::Connection;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, warn};

const SAVEPOINT: &str = "tickdb_nested";

thread_local! {
    /// Touched-table sets of the transactions open on this thread, innermost last.
    static ACTIVE: RefCell<Vec<Rc<RefCell<TouchedTables>>>> = const { RefCell::new(Vec::new()) };
}

/// Record a statement run outside a [`Tx`] handle into the innermost open
/// transaction on this thread. Returns `false` when no transaction is open.
pub(crate) fn record_in_active(sql: &str) -> bool {
    ACTIVE.with(|stack| match stack.borrow().last() {
        Some(touched) => {
            touched.borrow_mut().record(sql);
            true
        }
        None => false,
    })
}

/// True while a transaction is open on this thread.
pub(crate) fn in_transaction() -> bool {
    ACTIVE.with(|stack| !stack.borrow().is_empty())
}

fn merge_into_active(touched: TouchedTables) -> std::result::Result<(), TouchedTables> {
    ACTIVE.with(|stack| match stack.borrow().last() {
        Some(parent) => {
            parent.borrow_mut().merge(touched);
            Ok(())
        }
        None => Err(touched),
    })
}

/// Keeps a transaction's touched set on the active stack for its lifetime.
struct ActiveScope;

impl ActiveScope {
    fn push(touched: Rc<RefCell<TouchedTables>>) -> Self {
        ACTIVE.with(|stack| stack.borrow_mut().push(touched));
        Self
    }
}

impl Drop for ActiveScope {
    fn drop(&mut self) {
        ACTIVE.with(|stack| stack.borrow_mut().pop());
    }
}

/// Rolls back on drop unless committed.
struct TransactionGuard<'c> {
    conn: &'c Connection,
    nested: bool,
    committed: bool,
}

impl<'c> TransactionGuard<'c> {
    fn begin(conn: &'c Connection) -> Result<Self> {
        let nested = !conn.is_autocommit();
        if nested {
            conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT}"))?;
        } else {
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(Self {
            conn,
            nested,
            committed: false,
        })
    }

    fn commit(mut self) -> Result<()> {
        if self.nested {
            self.conn.execute_batch(&format!("RELEASE {SAVEPOINT}"))?;
        } else {
            self.conn.execute_batch("COMMIT")?;
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let rollback = if self.nested {
            format!("ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT}")
        } else {
            "ROLLBACK".to_string()
        };
        if let Err(err) = self.conn.execute_batch(&rollback) {
            warn!(error = %err, nested = self.nested, "transaction rollback failed");
        }
    }
}

/// Run `work` inside a transaction on `conn`.
///
/// `on_commit` receives the touched tables of an outermost transaction
/// after its commit succeeds. It is not called on rollback, and not called
/// for nested transactions whose tables were folded into their parent.
///
/// # Errors
///
/// Returns the error from `work` (after rolling back), or a storage error
/// from `BEGIN`/`COMMIT`.
pub(crate) fn run_transaction<T, W, C>(conn: &Connection, work: W, on_commit: C) -> Result<T>
where
    W: FnOnce(&mut Tx<'_>) -> Result<T>,
    C: FnOnce(&TouchedTables),
{
    let guard = TransactionGuard::begin(conn)?;
    let nested = guard.nested;
    let touched = Rc::new(RefCell::new(TouchedTables::new()));

    let value = {
        let _scope = ActiveScope::push(Rc::clone(&touched));
        let mut tx = Tx {
            conn,
            touched: Rc::clone(&touched),
        };
        work(&mut tx)
    }?;
    guard.commit()?;

    let touched = touched.take();
    if nested {
        if let Err(orphan) = merge_into_active(touched) {
            // Savepoint inside a transaction we are not tracking.
            on_commit(&orphan);
        }
    } else if !touched.is_empty() {
        debug!(clear_all = touched.clears_all(), tables = touched.tables().count(), "transaction committed");
        on_commit(&touched);
    }
    Ok(value)
}

/// Handle to an open transaction. Statements run on the transaction's
/// connection in the order they are issued.
pub struct Tx<'c> {
    conn: &'c Connection,
    touched: Rc<RefCell<TouchedTables>>,
}

impl Tx<'_> {
    /// Execute a statement and record its target table.
    ///
    /// # Errors
    ///
    /// Returns an error if the statement fails.
    pub fn execute(&mut self, sql: &str, params: &[Param]) -> Result<usize> {
        let changed = execute_statement(self.conn, sql, params)?;
        self.touched.borrow_mut().record(sql);
        Ok(changed)
    }

    /// Execute a batch of statements without parameters. The whole cache is
    /// invalidated on commit.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails.
    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        self.touched.borrow_mut().mark_all();
        Ok(())
    }

    /// Query uncached, seeing this transaction's own writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub fn query<T>(&self, sql: &str, params: &[Param], mapper: &RowMapper<T>) -> Result<Vec<T>> {
        query_rows(self.conn, sql, params, mapper)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails or the row cannot be decoded.
    pub fn query_one<T>(&self, sql: &str, params: &[Param], mapper: &RowMapper<T>) -> Result<Option<T>> {
        query_first(self.conn, sql, params, mapper)
    }

    /// Mark a table as touched without running a statement, for writes the
    /// statement parser cannot see (triggers, raw connection access).
    pub fn touch(&mut self, table: &str) {
        self.touched.borrow_mut().touch(table);
    }

    /// Persisted schema version (`PRAGMA user_version`).
    ///
    /// # Errors
    ///
    /// Returns an error if the pragma cannot be read.
    pub fn user_version(&self) -> Result<u32> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(u32::try_from(version).unwrap_or(0))
    }

    /// # Errors
    ///
    /// Returns an error if the pragma cannot be written.
    pub fn set_user_version(&mut self, version: u32) -> Result<()> {
        self.conn.pragma_update(None, "user_version", version)?;
        Ok(())
    }

    /// The transaction's connection, for helpers that need raw access.
    /// Writes made through it are not recorded; use [`touch`](Self::touch).
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        self.conn
    }
}
