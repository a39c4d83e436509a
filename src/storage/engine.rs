//! Single-writer execution engine.
//!
//! Every operation that touches the store (opening the connection, applying
//! pragmas, running statements) is executed on one dedicated worker thread
//! per store. Callers hand units of work to the worker over a channel and
//! wait on a [`Pending`] handle; units run strictly in submission order and
//! never interleave.
//!
//! A unit submitted from the worker thread itself (a cache loader invoked
//! from inside a transaction, say) runs inline on the worker's connection
//! instead of being queued behind the unit that is submitting it.

use crate::error::{ExecutionError, Result, StoreError};
use crate::storage::pending::{Cancel, Pending};
use parking_lot::Mutex;
use rusqlite::{Connection, InterruptHandle};
use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak, mpsc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, warn};

thread_local! {
    /// The connection owned by the worker running on this thread, if any.
    static WORKER_CONNECTION: RefCell<Option<Rc<Connection>>> = const { RefCell::new(None) };
}

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

impl StoreLocation {
    /// Short name used for the worker thread and diagnostics.
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            Self::File(path) => path
                .file_name()
                .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned()),
            Self::Memory => ":memory:".to_string(),
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Memory => None,
        }
    }
}

/// Baseline settings applied to every freshly opened connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub foreign_keys: bool,
    pub journal_mode: String,
    pub synchronous: String,
    pub busy_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            foreign_keys: true,
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

/// Apply connection settings.
///
/// # Errors
///
/// Returns an error if any pragma is rejected by SQLite.
pub fn apply_pragmas(conn: &Connection, settings: &ConnectionSettings) -> rusqlite::Result<()> {
    conn.pragma_update(
        None,
        "foreign_keys",
        if settings.foreign_keys { "ON" } else { "OFF" },
    )?;
    conn.busy_timeout(settings.busy_timeout)?;

    // journal_mode reports the mode actually in effect; in-memory stores stay on MEMORY.
    let mode: String = conn.pragma_update_and_check(
        None,
        "journal_mode",
        settings.journal_mode.as_str(),
        |row| row.get(0),
    )?;
    if !mode.eq_ignore_ascii_case(&settings.journal_mode) {
        debug!(requested = %settings.journal_mode, effective = %mode, "journal mode differs");
    }

    conn.pragma_update(None, "synchronous", settings.synchronous.as_str())?;
    Ok(())
}

fn open_connection(
    location: &StoreLocation,
    settings: &ConnectionSettings,
) -> rusqlite::Result<Connection> {
    let conn = match location {
        StoreLocation::File(path) => Connection::open(path)?,
        StoreLocation::Memory => Connection::open_in_memory()?,
    };
    apply_pragmas(&conn, settings)?;
    info!(store = %location.display_name(), "opened store connection");
    Ok(conn)
}

type Work = Box<dyn FnOnce(std::result::Result<&Connection, ExecutionError>) + Send>;

struct Job {
    id: u64,
    cancelled: Arc<AtomicBool>,
    work: Work,
}

struct EngineState {
    name: String,
    /// Id of the job currently running on the worker (0 when idle).
    running: Mutex<u64>,
    interrupt: Mutex<Option<InterruptHandle>>,
    next_job: AtomicU64,
}

struct JobCanceller {
    job_id: u64,
    flag: Arc<AtomicBool>,
    state: Weak<EngineState>,
}

impl Cancel for JobCanceller {
    fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let running = state.running.lock();
        if *running == self.job_id {
            if let Some(handle) = state.interrupt.lock().as_ref() {
                debug!(store = %state.name, job = self.job_id, "interrupting running unit");
                handle.interrupt();
            }
        }
    }
}

/// Owns the worker thread and the channel feeding it.
pub struct StorageEngine {
    state: Arc<EngineState>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl StorageEngine {
    /// Spawn the worker and warm the store: the first unit opens the
    /// connection and applies the baseline settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be spawned or the store
    /// cannot be opened.
    pub fn start(location: StoreLocation, settings: ConnectionSettings) -> Result<Self> {
        let name = location.display_name();
        let state = Arc::new(EngineState {
            name: name.clone(),
            running: Mutex::new(0),
            interrupt: Mutex::new(None),
            next_job: AtomicU64::new(1),
        });
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name(format!("tickdb-sqlite-{name}"))
            .spawn(move || run_worker(&location, &settings, &worker_state, &receiver))?;

        let engine = Self {
            state,
            sender: Mutex::new(Some(sender)),
            worker_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
        };
        engine.submit(|_| Ok(()))?;
        Ok(engine)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// True when called from this engine's worker thread.
    #[must_use]
    pub fn on_worker(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Run `work` on the worker and block until it finishes.
    ///
    /// # Errors
    ///
    /// Returns whatever `work` returns, or an execution error if the worker
    /// is unavailable or the unit panicked.
    pub fn submit<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.on_worker() {
            return with_worker_connection(&self.state.name, work);
        }
        self.submit_async(work).join()
    }

    /// Queue `work` and return a cancellable handle to its result.
    pub fn submit_async<T, F>(&self, work: F) -> Pending<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pending = Pending::new();
        let canceller = self.dispatch(pending.clone(), work);
        pending.with_canceller(canceller)
    }

    /// Queue `work` so that it completes `pending`. Panics inside `work` are
    /// caught and reported through the handle.
    pub(crate) fn dispatch<T, F>(&self, pending: Pending<T>, work: F) -> Arc<dyn Cancel>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.dispatch_with(pending, work, |_| {})
    }

    /// Like [`dispatch`](Self::dispatch), with `finish` observing the
    /// outcome on the worker before any waiter is woken. `finish` runs even
    /// when the unit never gets a connection.
    pub(crate) fn dispatch_with<T, F, D>(&self, pending: Pending<T>, work: F, finish: D) -> Arc<dyn Cancel>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        D: FnOnce(&Result<T>) + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(Box::new(move |conn| {
            let result = match conn {
                Ok(conn) => panic::catch_unwind(AssertUnwindSafe(|| work(conn)))
                    .unwrap_or_else(|payload| {
                        Err(ExecutionError::Panicked(panic_message(payload.as_ref())).into())
                    }),
                Err(err) => Err(err.into()),
            };
            finish(&result);
            pending.complete(result);
        }))
    }

    /// Queue a raw unit. The unit always runs exactly once: with the
    /// connection, or with the reason it cannot have one.
    pub(crate) fn enqueue(&self, work: Work) -> Arc<dyn Cancel> {
        let job_id = self.state.next_job.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        let canceller: Arc<dyn Cancel> = Arc::new(JobCanceller {
            job_id,
            flag: Arc::clone(&cancelled),
            state: Arc::downgrade(&self.state),
        });

        if self.on_worker() {
            run_on_worker_connection(&self.state.name, work);
            return canceller;
        }

        let job = Job {
            id: job_id,
            cancelled,
            work,
        };
        let rejected = {
            let sender = self.sender.lock();
            match sender.as_ref() {
                Some(tx) => tx.send(job).err().map(|mpsc::SendError(job)| job),
                None => Some(job),
            }
        };
        if let Some(job) = rejected {
            (job.work)(Err(self.unavailable()));
        }
        canceller
    }

    /// Stop accepting work, let queued units drain, and join the worker.
    pub fn close(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        if self.on_worker() {
            // The worker exits on its own once the current unit returns.
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!(store = %self.state.name, "storage worker panicked during shutdown");
            }
        }
    }

    fn unavailable(&self) -> ExecutionError {
        ExecutionError::WorkerUnavailable {
            store: self.state.name.clone(),
        }
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("name", &self.state.name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn current_connection() -> Option<Rc<Connection>> {
    WORKER_CONNECTION.with(|cell| cell.borrow().clone())
}

fn with_worker_connection<T, F>(store: &str, work: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T>,
{
    match current_connection() {
        Some(conn) => work(&conn),
        None => Err(StoreError::Execution(ExecutionError::WorkerUnavailable {
            store: store.to_string(),
        })),
    }
}

fn run_on_worker_connection(store: &str, work: Work) {
    match current_connection() {
        Some(conn) => work(Ok(&*conn)),
        None => work(Err(ExecutionError::WorkerUnavailable {
            store: store.to_string(),
        })),
    }
}

fn run_worker(
    location: &StoreLocation,
    settings: &ConnectionSettings,
    state: &EngineState,
    jobs: &mpsc::Receiver<Job>,
) {
    debug!(store = %state.name, "storage worker started");
    let mut connection: Option<Rc<Connection>> = None;

    for job in jobs {
        {
            let mut running = state.running.lock();
            if job.cancelled.load(Ordering::SeqCst) {
                drop(running);
                debug!(store = %state.name, job = job.id, "skipping cancelled unit");
                (job.work)(Err(ExecutionError::Interrupted));
                continue;
            }
            *running = job.id;
        }

        let conn = if let Some(conn) = &connection {
            Rc::clone(conn)
        } else {
            match open_connection(location, settings) {
                Ok(conn) => {
                    *state.interrupt.lock() = Some(conn.get_interrupt_handle());
                    let conn = Rc::new(conn);
                    WORKER_CONNECTION.with(|cell| *cell.borrow_mut() = Some(Rc::clone(&conn)));
                    connection = Some(Rc::clone(&conn));
                    conn
                }
                Err(err) => {
                    warn!(store = %state.name, error = %err, "failed to open store");
                    *state.running.lock() = 0;
                    (job.work)(Err(err.into()));
                    continue;
                }
            }
        };

        let work = job.work;
        if panic::catch_unwind(AssertUnwindSafe(|| work(Ok(&*conn)))).is_err() {
            error!(store = %state.name, job = job.id, "unit of work panicked");
        }
        *state.running.lock() = 0;

        if !conn.is_autocommit() {
            warn!(store = %state.name, job = job.id, "unit left a transaction open; rolling back");
            if let Err(err) = conn.execute_batch("ROLLBACK") {
                error!(store = %state.name, error = %err, "rollback of abandoned transaction failed");
            }
        }
    }

    WORKER_CONNECTION.with(|cell| cell.borrow_mut().take());
    state.interrupt.lock().take();
    drop(connection);
    debug!(store = %state.name, "storage worker stopped");
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
