//! One-shot, cancelable continuation primitive
//!
//! Chains multi-hop asynchronous request/response protocols without blocking
//! the initiating thread: a [`Continuation`] converts a result of type `A`
//! into a result of type `B` and forwards errors untouched, while its
//! [`CancelScope`] delegates cancellation to every inner asynchronous handle
//! accumulated along the way.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::error::{WaitError, WaitResult};
use super::message::{ErrorInfo, Uid};

/// One-shot receiver for an asynchronous outcome
pub trait Callback<T>: Send {
    /// Deliver the successful outcome. Consumes the callback.
    fn on_result(self: Box<Self>, value: T);

    /// Deliver a failure. Consumes the callback.
    fn on_error(self: Box<Self>, error: ErrorInfo);
}

/// Handle whose in-flight work can be cancelled
pub trait Cancelable: Send + Sync {
    /// Request cancellation. Advisory and idempotent.
    fn cancel(&self);
}

#[derive(Default)]
struct ScopeInner {
    cancelled: AtomicBool,
    handles: Mutex<Vec<Arc<dyn Cancelable>>>,
}

/// Shared cancellation-delegation set
///
/// Every asynchronous entry point hands one of these back to its caller.
/// Cancelling the scope cancels every registered inner handle; handles
/// registered after cancellation are cancelled immediately.
#[derive(Clone, Default)]
pub struct CancelScope {
    inner: Arc<ScopeInner>,
}

impl CancelScope {
    /// Create a fresh, uncancelled scope
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inner handle to be cancelled along with this scope
    pub fn register(&self, handle: Arc<dyn Cancelable>) {
        if self.inner.cancelled.load(Ordering::Acquire) {
            handle.cancel();
            return;
        }
        self.inner.handles.lock().push(handle);
    }

    /// Whether this scope has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

impl Cancelable for CancelScope {
    fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            handle.cancel();
        }
    }
}

/// Adapter from a result of type `A` to a result of type `B`
///
/// Implements [`Callback<A>`]: a delivered `A` is converted and forwarded to
/// the downstream callback, errors pass through untouched, and nothing is
/// delivered once the scope is cancelled.
pub struct Continuation<A, B> {
    convert: Box<dyn FnOnce(A) -> Result<B, ErrorInfo> + Send>,
    downstream: Box<dyn Callback<B>>,
    scope: CancelScope,
}

impl<A, B> Continuation<A, B> {
    /// Build a continuation forwarding into `downstream` through `convert`
    pub fn new<F>(downstream: Box<dyn Callback<B>>, convert: F) -> Self
    where
        F: FnOnce(A) -> Result<B, ErrorInfo> + Send + 'static,
    {
        Self {
            convert: Box::new(convert),
            downstream,
            scope: CancelScope::new(),
        }
    }

    /// The cancellation scope shared with inner asynchronous handles
    pub fn scope(&self) -> CancelScope {
        self.scope.clone()
    }
}

impl<A, B> Callback<A> for Continuation<A, B> {
    fn on_result(self: Box<Self>, value: A) {
        if self.scope.is_cancelled() {
            return;
        }
        match (self.convert)(value) {
            Ok(converted) => self.downstream.on_result(converted),
            Err(error) => self.downstream.on_error(error),
        }
    }

    fn on_error(self: Box<Self>, error: ErrorInfo) {
        if self.scope.is_cancelled() {
            return;
        }
        self.downstream.on_error(error);
    }
}

struct SlotInner<T> {
    outcome: Mutex<Option<Result<T, ErrorInfo>>>,
    cond: Condvar,
}

/// Callback half of [`blocking_pair`]
pub struct BlockingCallback<T> {
    slot: Arc<SlotInner<T>>,
}

impl<T: Send> Callback<T> for BlockingCallback<T> {
    fn on_result(self: Box<Self>, value: T) {
        let mut outcome = self.slot.outcome.lock();
        *outcome = Some(Ok(value));
        self.slot.cond.notify_all();
    }

    fn on_error(self: Box<Self>, error: ErrorInfo) {
        let mut outcome = self.slot.outcome.lock();
        *outcome = Some(Err(error));
        self.slot.cond.notify_all();
    }
}

/// Waiter half of [`blocking_pair`]
pub struct BlockingWaiter<T> {
    slot: Arc<SlotInner<T>>,
    uid: Uid,
}

impl<T> BlockingWaiter<T> {
    /// Block the calling thread until the outcome arrives or `timeout`
    /// elapses
    pub fn wait(self, timeout: Duration) -> WaitResult<Result<T, ErrorInfo>> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.slot.outcome.lock();
        loop {
            if let Some(result) = outcome.take() {
                return Ok(result);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout {
                    uid: self.uid,
                    timeout,
                });
            }
            if self
                .slot
                .cond
                .wait_until(&mut outcome, deadline)
                .timed_out()
            {
                return match outcome.take() {
                    Some(result) => Ok(result),
                    None => Err(WaitError::Timeout {
                        uid: self.uid,
                        timeout,
                    }),
                };
            }
        }
    }
}

/// Create a connected callback/waiter pair
///
/// Synchronous convenience wrappers hand the callback into a continuation
/// chain and block on the waiter; `uid` labels the resulting timeout error.
pub fn blocking_pair<T: Send>(uid: Uid) -> (Box<BlockingCallback<T>>, BlockingWaiter<T>) {
    let slot = Arc::new(SlotInner {
        outcome: Mutex::new(None),
        cond: Condvar::new(),
    });
    (
        Box::new(BlockingCallback { slot: slot.clone() }),
        BlockingWaiter { slot, uid },
    )
}
