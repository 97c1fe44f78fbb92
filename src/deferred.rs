//! Single-settlement results with a progress side channel.
//!
//! A [`Deferred`] is a future that resolves once with the result of a call. It
//! also carries a [`Progress`] registry that every derived `Deferred` shares,
//! so subscribing on the end of a `map`/`then`/`and_then` chain sees the same
//! progress messages as subscribing on the original.

use crate::error::{CallError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Subscriber = Box<dyn FnMut(&Value) + Send>;

// =============================================================================
// Progress registry
// =============================================================================

#[derive(Default)]
struct Registry {
    subscribers: Vec<Subscriber>,
    settled: bool,
    delivered: u64,
}

/// Shared list of progress subscribers for one call.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct Progress {
    inner: Arc<Mutex<Registry>>,
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        f.debug_struct("Progress")
            .field("subscribers", &registry.subscribers.len())
            .field("settled", &registry.settled)
            .field("delivered", &registry.delivered)
            .finish()
    }
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // Each critical section is a single update, so the registry is still
        // consistent if a thread panicked while holding the lock.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a callback for every later progress message.
    ///
    /// Subscribing after the call settled is accepted; the callback never runs.
    pub fn subscribe<F>(&self, callback: F) -> &Self
    where
        F: FnMut(&Value) + Send + 'static,
    {
        let mut registry = self.lock();
        if !registry.settled {
            registry.subscribers.push(Box::new(callback));
        }
        self
    }

    /// Register an unbounded channel receiving every later progress message.
    ///
    /// The receiver yields `None` once the call has settled and all queued
    /// messages were read.
    pub fn stream(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(move |message| {
            let _ = tx.send(message.clone());
        });
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn is_settled(&self) -> bool {
        self.lock().settled
    }

    /// Number of messages dispatched so far.
    pub fn delivered(&self) -> u64 {
        self.lock().delivered
    }

    /// Deliver one message to all subscribers in registration order.
    ///
    /// The lock is not held while callbacks run, so a callback may subscribe
    /// again; such late registrations start with the next message.
    pub(crate) fn emit(&self, message: &Value) {
        let mut subscribers = {
            let mut registry = self.lock();
            if registry.settled {
                return;
            }
            registry.delivered += 1;
            std::mem::take(&mut registry.subscribers)
        };

        for subscriber in subscribers.iter_mut() {
            subscriber(message);
        }

        let mut registry = self.lock();
        let added = std::mem::replace(&mut registry.subscribers, subscribers);
        if registry.settled {
            registry.subscribers.clear();
        } else {
            registry.subscribers.extend(added);
        }
    }

    /// Mark the call settled and drop every subscriber.
    ///
    /// Returns `false` if it was already settled.
    pub(crate) fn settle(&self) -> bool {
        let mut registry = self.lock();
        if registry.settled {
            return false;
        }
        registry.settled = true;
        registry.subscribers.clear();
        true
    }
}

// =============================================================================
// Settlement
// =============================================================================

/// Single-assignment outcome slot.
#[derive(Debug, Default)]
pub enum Settlement<T> {
    #[default]
    Pending,
    Fulfilled(T),
    Rejected(CallError),
    /// The outcome was handed out; the slot stays closed.
    Taken,
}

impl<T> Settlement<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Returns `false` (and changes nothing) unless still pending.
    pub fn fulfill(&mut self, value: T) -> bool {
        if !self.is_pending() {
            return false;
        }
        *self = Self::Fulfilled(value);
        true
    }

    /// Returns `false` (and changes nothing) unless still pending.
    pub fn reject(&mut self, error: CallError) -> bool {
        if !self.is_pending() {
            return false;
        }
        *self = Self::Rejected(error);
        true
    }

    pub fn take(&mut self) -> Option<Result<T>> {
        match std::mem::replace(self, Self::Taken) {
            Self::Fulfilled(value) => Some(Ok(value)),
            Self::Rejected(error) => Some(Err(error)),
            other => {
                *self = other;
                None
            }
        }
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cancels the call behind a [`Deferred`] and everything derived from it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Idempotent. Takes effect at the next transport event boundary.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

// =============================================================================
// Deferred
// =============================================================================

/// Result of a call, with progress subscription.
///
/// `Deferred` is lazy: nothing happens until it is awaited (or polled), so
/// subscriptions registered before the first `.await` observe every message.
#[must_use = "a Deferred does nothing unless awaited"]
pub struct Deferred<T> {
    future: BoxFuture<'static, Result<T>>,
    progress: Progress,
    cancel: CancellationToken,
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("progress", &self.progress)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Deferred<T> {
    /// Build a root `Deferred` from a driver future.
    ///
    /// The driver receives the progress registry to emit into and the token
    /// to watch for cancellation.
    pub fn new<F, Fut>(driver: F) -> Self
    where
        F: FnOnce(Progress, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let progress = Progress::new();
        let cancel = CancellationToken::new();
        let future = driver(progress.clone(), cancel.clone()).boxed();
        Self {
            future,
            progress,
            cancel,
        }
    }

    /// A `Deferred` already settled with `value`.
    pub fn fulfilled(value: T) -> Self {
        Self::settled(Ok(value))
    }

    /// A `Deferred` already settled with `error`.
    pub fn rejected(error: CallError) -> Self {
        Self::settled(Err(error))
    }

    fn settled(outcome: Result<T>) -> Self {
        let progress = Progress::new();
        progress.settle();
        Self {
            future: futures::future::ready(outcome).boxed(),
            progress,
            cancel: CancellationToken::new(),
        }
    }

    fn derive<U, Fut>(self, wrap: impl FnOnce(BoxFuture<'static, Result<T>>) -> Fut) -> Deferred<U>
    where
        Fut: Future<Output = Result<U>> + Send + 'static,
    {
        Deferred {
            future: wrap(self.future).boxed(),
            progress: self.progress,
            cancel: self.cancel,
        }
    }

    /// Registers `callback` for every progress message of the underlying call.
    pub fn on_progress<F>(&self, callback: F) -> &Self
    where
        F: FnMut(&Value) + Send + 'static,
    {
        self.progress.subscribe(callback);
        self
    }

    /// Handle to the shared progress registry.
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.cancel.clone(),
        }
    }

    /// Transform the outcome, success or failure.
    pub fn then<U, F>(self, f: F) -> Deferred<U>
    where
        U: Send + 'static,
        F: FnOnce(Result<T>) -> Result<U> + Send + 'static,
    {
        self.derive(|future| async move { f(future.await) })
    }

    /// Transform a successful value.
    pub fn map<U, F>(self, f: F) -> Deferred<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then(|outcome| outcome.map(f))
    }

    /// Chain an async continuation onto a successful value.
    pub fn and_then<U, F, Fut>(self, f: F) -> Deferred<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U>> + Send + 'static,
    {
        self.derive(|future| async move { f(future.await?).await })
    }

    /// Recover from a failure.
    pub fn or_else<F>(self, f: F) -> Deferred<T>
    where
        F: FnOnce(CallError) -> Result<T> + Send + 'static,
    {
        self.then(|outcome| outcome.or_else(f))
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scripted(messages: Vec<Value>, result: Value) -> Deferred<Value> {
        Deferred::new(move |progress, _cancel| async move {
            for message in &messages {
                tokio::task::yield_now().await;
                progress.emit(message);
            }
            progress.settle();
            Ok(result)
        })
    }

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, impl FnMut(&Value) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |v: &Value| sink.lock().unwrap().push(v.clone()))
    }

    #[tokio::test]
    async fn test_subscribers_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let deferred = scripted(vec![json!(1), json!(2)], json!("done"));

        let (a, b) = (order.clone(), order.clone());
        deferred
            .on_progress(move |v| a.lock().unwrap().push(format!("a{v}")))
            .on_progress(move |v| b.lock().unwrap().push(format!("b{v}")));

        assert_eq!(deferred.await.unwrap(), json!("done"));
        assert_eq!(*order.lock().unwrap(), vec!["a1", "b1", "a2", "b2"]);
    }

    #[tokio::test]
    async fn test_progress_survives_chaining() {
        let messages = vec![json!({"progress": 1}), json!({"progress": 2})];
        let deferred = scripted(messages.clone(), json!(40));

        let chained = deferred
            .map(|v| v.as_i64().unwrap_or(0))
            .then(|r| r.map(|n| n + 1))
            .and_then(|n| async move { Ok(n + 1) });

        let (seen, callback) = recorder();
        chained.on_progress(callback);

        assert_eq!(chained.await.unwrap(), 42);
        assert_eq!(*seen.lock().unwrap(), messages);
    }

    #[tokio::test]
    async fn test_original_and_derived_share_registry() {
        let deferred = scripted(vec![json!("p")], json!(null));
        let progress = deferred.progress().clone();
        let derived = deferred.map(|_| ());

        let (seen, callback) = recorder();
        progress.subscribe(callback);
        assert_eq!(derived.progress().subscriber_count(), 1);

        derived.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!("p")]);
    }

    #[tokio::test]
    async fn test_progress_stream_closes_after_settlement() {
        let deferred = scripted(vec![json!(1), json!(2), json!(3)], json!(0));
        let mut rx = deferred.progress().stream();

        deferred.await.unwrap();

        let mut received = Vec::new();
        while let Some(v) = rx.recv().await {
            received.push(v);
        }
        assert_eq!(received, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_late_subscription_never_fires() {
        let calls = Arc::new(AtomicUsize::new(0));
        let deferred = scripted(vec![json!(1)], json!(0));
        let progress = deferred.progress().clone();
        deferred.await.unwrap();

        let counter = calls.clone();
        progress.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        progress.emit(&json!(2));

        assert_eq!(progress.subscriber_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reentrant_subscribe_starts_with_next_message() {
        let progress = Progress::new();
        let (seen, callback) = recorder();
        let mut callback = Some(callback);
        let handle = progress.clone();

        progress.subscribe(move |_| {
            if let Some(cb) = callback.take() {
                handle.subscribe(cb);
            }
        });

        progress.emit(&json!(1));
        progress.emit(&json!(2));

        assert_eq!(*seen.lock().unwrap(), vec![json!(2)]);
        assert_eq!(progress.subscriber_count(), 2);
        assert_eq!(progress.delivered(), 2);
    }

    #[test]
    fn test_registry_usable_after_subscriber_panic() {
        let progress = Progress::new();
        progress.subscribe(|_| panic!("subscriber failed"));

        let emitted = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            progress.emit(&json!(1));
        }));
        assert!(emitted.is_err());

        let (seen, callback) = recorder();
        progress.subscribe(callback);
        progress.emit(&json!(2));
        assert_eq!(*seen.lock().unwrap(), vec![json!(2)]);
        assert!(progress.settle());
    }

    #[test]
    fn test_settle_is_single_shot() {
        let progress = Progress::new();
        assert!(progress.settle());
        assert!(!progress.settle());
        assert!(progress.is_settled());
    }

    #[test]
    fn test_settlement_single_assignment() {
        let mut settlement = Settlement::Pending;
        assert!(settlement.fulfill(1));
        assert!(!settlement.fulfill(2));
        assert!(!settlement.reject(CallError::Cancelled));
        assert_eq!(settlement.take().unwrap().unwrap(), 1);

        // Taken stays closed
        assert!(!settlement.fulfill(3));
        assert!(settlement.take().is_none());
    }

    #[test]
    fn test_take_pending_is_none() {
        let mut settlement: Settlement<i32> = Settlement::Pending;
        assert!(settlement.take().is_none());
        assert!(settlement.is_pending());
    }

    #[tokio::test]
    async fn test_or_else_recovers() {
        let value = Deferred::<i32>::rejected(CallError::Cancelled)
            .or_else(|err| if err.is_cancelled() { Ok(-1) } else { Err(err) })
            .await
            .unwrap();
        assert_eq!(value, -1);
    }

    #[tokio::test]
    async fn test_cancel_handle_reaches_driver() {
        let deferred = Deferred::new(|_progress, cancel| async move {
            cancel.cancelled().await;
            Err::<(), _>(CallError::Cancelled)
        });
        let handle = deferred.map(|_| ()).cancel_handle();
        handle.cancel();
        handle.cancel();

        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_handle_shared_with_derived() {
        let deferred = Deferred::new(|_progress, cancel| async move {
            cancel.cancelled().await;
            Err::<(), _>(CallError::Cancelled)
        });
        let handle = deferred.cancel_handle();
        let derived = deferred.map(|_| 1);
        handle.cancel();

        assert!(derived.await.unwrap_err().is_cancelled());
    }
}
