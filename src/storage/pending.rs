//! Shared completion handles.
//!
//! A [`Pending`] is the result slot of a unit of work that runs elsewhere
//! (the storage worker, or a refresh spawner). Clones observe the same slot,
//! which is what makes single-flight loads possible: the first caller installs
//! a pending handle in the cache and later callers wait on a clone of it.

use crate::error::{ExecutionError, Result};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_PENDING_ID: AtomicU64 = AtomicU64::new(1);

struct Slot<T> {
    id: u64,
    result: Mutex<Option<Result<T>>>,
    ready: Condvar,
}

/// Best-effort cancellation of the unit of work behind a [`Pending`].
pub(crate) trait Cancel: Send + Sync {
    fn cancel(&self);
}

/// Handle to a result that will be produced by another thread.
pub struct Pending<T> {
    slot: Arc<Slot<T>>,
    canceller: Option<Arc<dyn Cancel>>,
}

impl<T> Pending<T> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Slot {
                id: NEXT_PENDING_ID.fetch_add(1, Ordering::Relaxed),
                result: Mutex::new(None),
                ready: Condvar::new(),
            }),
            canceller: None,
        }
    }

    /// A handle that is already complete.
    #[must_use]
    pub fn ready(result: Result<T>) -> Self {
        let pending = Self::new();
        pending.complete(result);
        pending
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.slot.result.lock().is_some()
    }

    /// Store the result and wake every waiter. The first completion wins;
    /// later ones are ignored and return `false`.
    pub(crate) fn complete(&self, result: Result<T>) -> bool {
        let mut guard = self.slot.result.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(result);
        drop(guard);
        self.slot.ready.notify_all();
        true
    }

    pub(crate) fn with_canceller(mut self, canceller: Arc<dyn Cancel>) -> Self {
        self.canceller = Some(canceller);
        self
    }

    /// A clone that cannot cancel the underlying work. Handed out when the
    /// work is shared with other waiters.
    #[must_use]
    pub fn detached(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            canceller: None,
        }
    }

    /// Request best-effort cancellation. A unit that has not started is
    /// skipped; a running statement is interrupted. Work already committed by
    /// the store is not undone. No-op on detached handles.
    pub fn cancel(&self) {
        if let Some(canceller) = &self.canceller {
            canceller.cancel();
        }
    }

    /// Block until complete and take the result out of the slot.
    ///
    /// Only for handles with a single consumer; other clones will see the
    /// slot as empty afterwards.
    pub(crate) fn join(self) -> Result<T> {
        let mut guard = self.slot.result.lock();
        while guard.is_none() {
            self.slot.ready.wait(&mut guard);
        }
        guard
            .take()
            .unwrap_or_else(|| Err(ExecutionError::Interrupted.into()))
    }
}

impl<T: Clone> Pending<T> {
    /// Block until the result is available.
    ///
    /// # Errors
    ///
    /// Returns the error the unit of work completed with.
    pub fn wait(&self) -> Result<T> {
        let mut guard = self.slot.result.lock();
        loop {
            if let Some(result) = guard.as_ref() {
                return result.clone();
            }
            self.slot.ready.wait(&mut guard);
        }
    }

    /// Block for at most `timeout`. Returns `None` if the result is still
    /// outstanding when the timeout expires.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.slot.result.lock();
        loop {
            if let Some(result) = guard.as_ref() {
                return Some(result.clone());
            }
            if self.slot.ready.wait_until(&mut guard, deadline).timed_out() {
                return guard.as_ref().cloned();
            }
        }
    }
}

impl<T> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            canceller: self.canceller.clone(),
        }
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("id", &self.slot.id)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Type-erased view of an in-flight load, stored in cache entries whose
/// value type is itself erased.
pub(crate) trait InFlight: Send + Sync {
    fn load_id(&self) -> u64;
    fn finished(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Send + 'static> InFlight for Pending<T> {
    fn load_id(&self) -> u64 {
        self.id()
    }

    fn finished(&self) -> bool {
        self.is_done()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl InFlight for Arc<dyn InFlight> {
    fn load_id(&self) -> u64 {
        (**self).load_id()
    }

    fn finished(&self) -> bool {
        (**self).finished()
    }

    fn as_any(&self) -> &dyn Any {
        (**self).as_any()
    }
}
