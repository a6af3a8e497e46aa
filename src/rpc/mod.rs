//! In-process remote invocation.
//!
//! Stage workers talk to each other through two call flavors:
//!
//! - [`call_async`]: request/response. Runs the call on its own named thread and
//!   returns an [`RpcFuture`] the caller can wait on now or later.
//! - [`notify`]: fire-and-forget. Failures are logged and cancel the pipeline,
//!   since nobody is waiting to observe them.
//!
//! Each call gets a dedicated OS thread because the invoked methods block on
//! monitors (waiting for outputs, topology, labels). A bounded pool would deadlock
//! once every worker is parked on a dependency that needs another pool slot.

pub mod future;
pub mod monitor;

pub use future::RpcFuture;
pub use monitor::{CancelToken, Monitor};

use crate::error::Result;
use std::thread;

/// Invoke `f` asynchronously and return a future for its result.
pub fn call_async<T, F>(name: impl Into<String>, token: &CancelToken, f: F) -> RpcFuture<T>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let future = RpcFuture::new(token);
    let completion = future.clone();
    let name = name.into();
    let origin = name.clone();

    let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
        let resolved = match f() {
            Ok(value) => completion.set(value),
            Err(e) => {
                if e.is_cancelled() {
                    tracing::debug!(call = %origin, "rpc call cancelled");
                } else {
                    tracing::warn!(call = %origin, error = %e, "rpc call failed");
                }
                completion.fail(origin.as_str(), &e)
            }
        };
        if let Err(e) = resolved {
            tracing::error!(call = %origin, error = %e, "rpc completion rejected");
        }
    });

    if let Err(e) = spawned {
        let err = crate::error::Error::Remote {
            origin: name.clone(),
            reason: format!("failed to spawn rpc thread: {e}"),
        };
        if let Err(e) = future.fail(name, &err) {
            tracing::error!(error = %e, "rpc spawn failure could not be recorded");
        }
    }

    future
}

/// Invoke `f` and block until it completes.
pub fn call_sync<T, F>(name: impl Into<String>, token: &CancelToken, f: F) -> Result<T>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    call_async(name, token, f).wait()
}

/// Invoke `f` without waiting for it.
///
/// An error other than cancellation cancels `token`, because a lost notification
/// would otherwise leave its target blocked forever.
pub fn notify<F>(name: impl Into<String>, token: &CancelToken, f: F)
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let name = name.into();
    let origin = name.clone();
    let cancel = token.clone();

    let spawned = thread::Builder::new().name(name).spawn(move || {
        if let Err(e) = f() {
            if e.is_cancelled() {
                tracing::debug!(call = %origin, "notification cancelled");
            } else {
                tracing::error!(call = %origin, error = %e, "notification failed");
                cancel.cancel(format!("{origin}: {e}"));
            }
        }
    });

    if let Err(e) = spawned {
        tracing::error!(error = %e, "failed to spawn notification thread");
        token.cancel(format!("failed to spawn notification thread: {e}"));
    }
}
