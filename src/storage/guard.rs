//! Blocking guard for latency-sensitive callers.
//!
//! One thread per process can be designated the *guarded context* (the
//! host's tick loop, typically). Calls made from it are subject to
//! [`BlockingOptions`]: they may be refused outright, bounded by a timeout,
//! or timed and reported when slow.

use crate::error::{Result, StoreError};
use crate::storage::pending::Pending;
use parking_lot::RwLock;
use std::fmt;
use std::str::FromStr;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What to do when a blocking call is made from the guarded context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MainThreadPolicy {
    /// No restriction, no diagnostics.
    Allow,
    /// Allowed, but slow calls are logged.
    Warn,
    /// Refused with [`StoreError::GuardedContextDisallowed`].
    Disallow,
}

/// What a guarded call returns when its timeout expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutBehavior {
    /// Return an absent result; no error surfaces.
    FailOpen,
    /// Raise [`StoreError::Timeout`].
    FailClosed,
    /// Raise [`StoreError::Timeout`].
    Throw,
}

impl MainThreadPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Warn => "warn",
            Self::Disallow => "disallow",
        }
    }
}

impl TimeoutBehavior {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FailOpen => "fail-open",
            Self::FailClosed => "fail-closed",
            Self::Throw => "throw",
        }
    }
}

impl FromStr for MainThreadPolicy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize_variant(s).as_str() {
            "allow" => Ok(Self::Allow),
            "warn" => Ok(Self::Warn),
            "disallow" => Ok(Self::Disallow),
            other => Err(StoreError::Config(format!(
                "unknown main thread policy '{other}' (expected allow, warn or disallow)"
            ))),
        }
    }
}

impl FromStr for TimeoutBehavior {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize_variant(s).as_str() {
            "fail-open" => Ok(Self::FailOpen),
            "fail-closed" => Ok(Self::FailClosed),
            "throw" => Ok(Self::Throw),
            other => Err(StoreError::Config(format!(
                "unknown timeout behavior '{other}' (expected fail-open, fail-closed or throw)"
            ))),
        }
    }
}

impl fmt::Display for MainThreadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for TimeoutBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalize_variant(raw: &str) -> String {
    raw.trim().to_lowercase().replace('_', "-")
}

/// Per-call blocking behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingOptions {
    /// Zero means wait without bound.
    pub timeout: Duration,
    pub main_thread_policy: MainThreadPolicy,
    pub timeout_behavior: TimeoutBehavior,
    /// Zero disables slow-call warnings.
    pub slow_warn_threshold: Duration,
}

impl BlockingOptions {
    /// Options for plain calls: unbounded wait, no guarded-context checks.
    #[must_use]
    pub const fn unguarded() -> Self {
        Self {
            timeout: Duration::ZERO,
            main_thread_policy: MainThreadPolicy::Allow,
            timeout_behavior: TimeoutBehavior::Throw,
            slow_warn_threshold: Duration::ZERO,
        }
    }

    /// Tight defaults for calls made from the guarded context: 15ms cap,
    /// warn at 5ms, raise on timeout.
    #[must_use]
    pub const fn guarded_default() -> Self {
        Self {
            timeout: Duration::from_millis(15),
            main_thread_policy: MainThreadPolicy::Warn,
            timeout_behavior: TimeoutBehavior::Throw,
            slow_warn_threshold: Duration::from_millis(5),
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: MainThreadPolicy) -> Self {
        self.main_thread_policy = policy;
        self
    }

    #[must_use]
    pub const fn with_timeout_behavior(mut self, behavior: TimeoutBehavior) -> Self {
        self.timeout_behavior = behavior;
        self
    }

    #[must_use]
    pub const fn with_slow_warn_threshold(mut self, threshold: Duration) -> Self {
        self.slow_warn_threshold = threshold;
        self
    }
}

impl Default for BlockingOptions {
    fn default() -> Self {
        Self::guarded_default()
    }
}

/// Identifies the guarded context.
#[derive(Debug, Default)]
pub struct GuardedContext {
    thread: RwLock<Option<ThreadId>>,
}

impl GuardedContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Designate the calling thread as the guarded context.
    pub fn designate_current(&self) {
        self.designate(thread::current().id());
    }

    pub fn designate(&self, thread: ThreadId) {
        *self.thread.write() = Some(thread);
    }

    pub fn clear(&self) {
        *self.thread.write() = None;
    }

    /// True when the calling thread is the guarded context.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.thread
            .read()
            .is_some_and(|id| id == thread::current().id())
    }
}

/// Run a unit of work under the guard.
///
/// `start` is only invoked once the policy check passes; it begins the work
/// and returns a handle to its result. `Ok(None)` means the call timed out
/// under [`TimeoutBehavior::FailOpen`].
///
/// # Errors
///
/// Returns [`StoreError::GuardedContextDisallowed`] before any work starts,
/// [`StoreError::Timeout`] on expiry under `FailClosed`/`Throw`, or the
/// error the work itself completed with.
pub fn run_guarded<T, S>(
    context: &GuardedContext,
    operation: &str,
    options: &BlockingOptions,
    start: S,
) -> Result<Option<T>>
where
    T: Clone,
    S: FnOnce() -> Result<Pending<T>>,
{
    let guarded = context.is_current();
    if guarded && options.main_thread_policy == MainThreadPolicy::Disallow {
        return Err(StoreError::GuardedContextDisallowed {
            operation: operation.to_string(),
        });
    }

    let started = Instant::now();
    let pending = start()?;

    if options.timeout.is_zero() {
        let value = pending.wait()?;
        warn_if_slow(guarded, options, operation, started);
        return Ok(Some(value));
    }

    if let Some(result) = pending.wait_timeout(options.timeout) {
        let value = result?;
        warn_if_slow(guarded, options, operation, started);
        return Ok(Some(value));
    }

    pending.cancel();
    match options.timeout_behavior {
        TimeoutBehavior::FailOpen => {
            debug!(operation, timeout_ms = options.timeout.as_millis(), "guarded call timed out; failing open");
            Ok(None)
        }
        TimeoutBehavior::FailClosed | TimeoutBehavior::Throw => Err(StoreError::Timeout {
            operation: operation.to_string(),
            timeout: options.timeout,
        }),
    }
}

fn warn_if_slow(guarded: bool, options: &BlockingOptions, operation: &str, started: Instant) {
    if !guarded
        || options.main_thread_policy != MainThreadPolicy::Warn
        || options.slow_warn_threshold.is_zero()
    {
        return;
    }
    let elapsed = started.elapsed();
    if elapsed >= options.slow_warn_threshold {
        warn!(
            operation,
            elapsed_ms = elapsed.as_millis(),
            threshold_ms = options.slow_warn_threshold.as_millis(),
            "slow storage call on guarded context"
        );
    }
}
