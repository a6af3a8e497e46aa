//! Monitors and cancellation.
//!
//! Every piece of cross-thread pipeline state lives in a [`Monitor`]: a mutex paired
//! with a condition variable and a [`CancelToken`]. Waiters block on a predicate
//! instead of polling, and cancelling the token wakes every registered monitor so a
//! stuck run can be aborted from any thread.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

/// Anything a [`CancelToken`] must wake when it fires.
trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

/// Registered monitors. Dead entries are pruned once the list doubles.
struct Waiters {
    list: Vec<Weak<dyn Interrupt>>,
    prune_at: usize,
}

struct TokenInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
    waiters: Mutex<Waiters>,
}

/// Shared cancellation flag threaded through every blocking wait.
///
/// Cloning is cheap; all clones observe the same state. The first call to
/// [`cancel`](Self::cancel) records the reason, later calls are no-ops.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

const PRUNE_FLOOR: usize = 64;

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                reason: Mutex::new(None),
                waiters: Mutex::new(Waiters {
                    list: Vec::new(),
                    prune_at: PRUNE_FLOOR,
                }),
            }),
        }
    }

    /// Cancel every wait tied to this token.
    ///
    /// Returns `true` if this call performed the cancellation.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        {
            let mut slot = self
                .inner
                .reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.into());
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);

        let live: Vec<Arc<dyn Interrupt>> = {
            let waiters = self
                .inner
                .waiters
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            waiters.list.iter().filter_map(Weak::upgrade).collect()
        };
        for waiter in live {
            waiter.interrupt();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Reason recorded by the first `cancel` call.
    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Error returned by waits aborted through this token.
    pub fn error(&self) -> Error {
        Error::Cancelled {
            reason: self.reason().unwrap_or_else(|| "cancelled".to_string()),
        }
    }

    fn register(&self, waiter: Weak<dyn Interrupt>) {
        let mut waiters = self
            .inner
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if waiters.list.len() >= waiters.prune_at {
            waiters.list.retain(|w| w.strong_count() > 0);
            waiters.prune_at = (waiters.list.len() * 2).max(PRUNE_FLOOR);
        }
        waiters.list.push(waiter);
    }

    #[cfg(test)]
    fn registered(&self) -> usize {
        self.inner
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .list
            .len()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Mutex + condition variable with cancellable predicate waits.
pub struct Monitor<T> {
    state: Mutex<T>,
    cond: Condvar,
    token: CancelToken,
}

impl<T: Send + 'static> Monitor<T> {
    /// Create a monitor and register it with `token`.
    pub fn new(value: T, token: &CancelToken) -> Arc<Self> {
        let monitor = Arc::new(Self {
            state: Mutex::new(value),
            cond: Condvar::new(),
            token: token.clone(),
        });
        let weak: Weak<dyn Interrupt> = Arc::downgrade(&monitor) as Weak<dyn Interrupt>;
        token.register(weak);
        monitor
    }
}

impl<T> Monitor<T> {
    /// Lock the state without waiting on any predicate.
    ///
    /// Guarded values are plain data, so a poisoned lock is recovered as-is.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the state and wake every waiter.
    pub fn update<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut guard = self.lock();
        let out = f(&mut guard);
        self.cond.notify_all();
        out
    }

    /// Block until `ready` holds, returning the guard with the predicate satisfied.
    ///
    /// Returns [`Error::Cancelled`] if the token fires first.
    pub fn wait_until(&self, mut ready: impl FnMut(&T) -> bool) -> Result<MutexGuard<'_, T>> {
        let guard = self.lock();
        let guard = self
            .cond
            .wait_while(guard, |state| !ready(&*state) && !self.token.is_cancelled())
            .unwrap_or_else(PoisonError::into_inner);
        if ready(&guard) {
            Ok(guard)
        } else {
            Err(self.token.error())
        }
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl<T: Send> Interrupt for Monitor<T> {
    fn interrupt(&self) {
        // Taking the lock orders the wakeup after any in-progress predicate check.
        let _guard = self.lock();
        self.cond.notify_all();
    }
}
