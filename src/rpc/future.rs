//! Single-assignment futures.

use super::monitor::{CancelToken, Monitor};
use crate::error::{Error, Result};
use std::sync::Arc;

enum Slot<T> {
    Pending,
    Ready(T),
    Failed {
        origin: String,
        reason: String,
        cancelled: bool,
    },
}

/// A value that is written exactly once and read by any number of waiters.
///
/// Clones share the same slot. Waiting observes the [`CancelToken`] the future was
/// created with.
pub struct RpcFuture<T> {
    slot: Arc<Monitor<Slot<T>>>,
}

impl<T> Clone for RpcFuture<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone + Send + 'static> RpcFuture<T> {
    pub fn new(token: &CancelToken) -> Self {
        Self {
            slot: Monitor::new(Slot::Pending, token),
        }
    }

    /// An already-resolved future.
    pub fn ready(value: T, token: &CancelToken) -> Self {
        Self {
            slot: Monitor::new(Slot::Ready(value), token),
        }
    }

    /// Resolve with a value. Fails if the future was already resolved.
    pub fn set(&self, value: T) -> Result<()> {
        self.slot.update(|slot| match slot {
            Slot::Pending => {
                *slot = Slot::Ready(value);
                Ok(())
            }
            _ => Err(Error::FutureAlreadySet),
        })
    }

    /// Resolve with a failure carrying `error`'s message.
    ///
    /// Cancellation is preserved, so waiters see [`Error::Cancelled`] rather than a
    /// remote fault.
    pub fn fail(&self, origin: impl Into<String>, error: &Error) -> Result<()> {
        let origin = origin.into();
        let (reason, cancelled) = match error {
            Error::Cancelled { reason } => (reason.clone(), true),
            other => (other.to_string(), false),
        };
        self.slot.update(|slot| match slot {
            Slot::Pending => {
                *slot = Slot::Failed {
                    origin,
                    reason,
                    cancelled,
                };
                Ok(())
            }
            _ => Err(Error::FutureAlreadySet),
        })
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Pending)
    }

    /// Block until resolved and return a clone of the value.
    pub fn wait(&self) -> Result<T> {
        let guard = self.slot.wait_until(|slot| !matches!(slot, Slot::Pending))?;
        match &*guard {
            Slot::Ready(value) => Ok(value.clone()),
            Slot::Failed {
                reason,
                cancelled: true,
                ..
            } => Err(Error::Cancelled {
                reason: reason.clone(),
            }),
            Slot::Failed { origin, reason, .. } => Err(Error::Remote {
                origin: origin.clone(),
                reason: reason.clone(),
            }),
            Slot::Pending => Err(Error::Invariant {
                reason: "future woke while still pending".to_string(),
            }),
        }
    }

    /// Whether both handles refer to the same slot.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<T> std::fmt::Debug for RpcFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.slot.lock() {
            Slot::Pending => "pending",
            Slot::Ready(_) => "ready",
            Slot::Failed { .. } => "failed",
        };
        f.debug_struct("RpcFuture").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_set_once() {
        let token = CancelToken::new();
        let fut = RpcFuture::<u32>::new(&token);
        assert!(!fut.is_done());
        fut.set(3).unwrap();
        assert!(matches!(fut.set(4), Err(Error::FutureAlreadySet)));
        assert_eq!(fut.wait().unwrap(), 3);
        assert_eq!(fut.wait().unwrap(), 3);
    }

    #[test]
    fn test_many_waiters_see_same_value() {
        let token = CancelToken::new();
        let fut = RpcFuture::<String>::new(&token);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let f = fut.clone();
                thread::spawn(move || f.wait().unwrap())
            })
            .collect();

        thread::sleep(Duration::from_millis(5));
        fut.set("done".to_string()).unwrap();
        for h in handles {
            assert_eq!(h.join().unwrap(), "done");
        }
    }

    #[test]
    fn test_failure_surfaces_as_remote() {
        let token = CancelToken::new();
        let fut = RpcFuture::<u32>::new(&token);
        let err = Error::Invariant {
            reason: "boom".to_string(),
        };
        fut.fail("stage-2", &err).unwrap();
        match fut.wait() {
            Err(Error::Remote { origin, reason }) => {
                assert_eq!(origin, "stage-2");
                assert!(reason.contains("boom"));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_failure_stays_cancelled() {
        let token = CancelToken::new();
        let fut = RpcFuture::<u32>::new(&token);
        fut.fail(
            "rpc",
            &Error::Cancelled {
                reason: "abort".to_string(),
            },
        )
        .unwrap();
        assert!(fut.wait().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_cancel_unblocks_pending_wait() {
        let token = CancelToken::new();
        let fut = RpcFuture::<u32>::new(&token);
        let waiter = fut.clone();
        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(5));
        token.cancel("stop");
        assert!(handle.join().unwrap().unwrap_err().is_cancelled());
    }
}
