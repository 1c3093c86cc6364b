use std::{
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{CounterCache, CounterError};

/// Boxed future produced by a request factory.
pub type BoxFut<'f, O> = Pin<Box<dyn Future<Output = O> + Send + 'f>>;

type Inflight<T> = HashMap<String, Weak<broadcast::Sender<T>>>;

/// Resolves to the result of the one in-flight request for a key.
pub struct Handle<T> {
    fut: BoxFut<'static, Result<T, RecvError>>,
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish()
    }
}

impl<T> Future for Handle<T> {
    type Output = Result<T, RecvError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.fut.poll_unpin(cx)
    }
}

impl<T> Handle<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(mut receiver: broadcast::Receiver<T>) -> Self {
        Self {
            fut: Box::pin(async move { receiver.recv().await }),
        }
    }
}

/// Per-key request coalescing: while a request for a key is running, further
/// callers for that key wait for its result instead of starting their own.
pub struct SingleFlight<T> {
    inflight: Arc<Mutex<Inflight<T>>>,
}

impl<T> fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight")
            .field("inflight", &self.inflight.lock().len())
            .finish()
    }
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Default::default(),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Join the in-flight request for `key`, or start one with `f`.
    ///
    /// The request runs on its own task, so it completes even if every
    /// caller stops waiting.
    pub fn handle<F>(&self, key: &str, f: F) -> Handle<T>
    where
        F: FnOnce() -> BoxFut<'static, T>,
    {
        // Held until the request is registered, so two callers cannot both
        // start one.
        let mut inflight = self.inflight.lock();
        if let Some(tx) = inflight.get(key).and_then(Weak::upgrade) {
            tracing::trace!(%key, "joining inflight request");
            return Handle::new(tx.subscribe());
        }

        let (tx, rx) = broadcast::channel::<T>(1);
        let tx = Arc::new(tx);
        inflight.insert(key.to_string(), Arc::downgrade(&tx));

        let fut = (f)();
        let registry = Arc::clone(&self.inflight);
        let key = key.to_string();
        tracing::trace!(%key, "launching request");
        tokio::spawn(async move {
            let value = fut.await;
            // Deregister and send under the lock, so a late subscriber either
            // joins before the send or starts a fresh request.
            let mut inflight = registry.lock();
            inflight.remove(&key);
            let _ = tx.send(value);
        });
        Handle::new(rx)
    }
}

/// Wraps a counter backend so concurrent reads of one key share a single
/// backend round trip. Increments pass straight through.
pub struct Coalesced<C> {
    inner: Arc<C>,
    reads: SingleFlight<Result<i64, CounterError>>,
}

impl<C: fmt::Debug> fmt::Debug for Coalesced<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalesced")
            .field("inner", &self.inner)
            .field("reads", &self.reads)
            .finish()
    }
}

impl<C> Coalesced<C> {
    /// Coalesce reads of `inner`.
    pub fn new(inner: C) -> Self {
        Self {
            inner: Arc::new(inner),
            reads: SingleFlight::default(),
        }
    }
}

#[async_trait]
impl<C> CounterCache for Coalesced<C>
where
    C: CounterCache + 'static,
{
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> Result<i64, CounterError> {
        let inner = Arc::clone(&self.inner);
        let owned = key.to_string();
        self.reads
            .handle(key, move || Box::pin(async move { inner.get(&owned).await }))
            .await
            .map_err(|_| CounterError::Abandoned(key.to_string()))?
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64, CounterError> {
        self.inner.increment(key, delta).await
    }
}
