//! Hot multicast streams with explicit activation
//!
//! A [`Multicast`] fans every published event out to all current subscribers,
//! in publish order, without replaying anything to late subscribers. Nothing
//! flows until [`Multicast::connect`] is called, so subscribers can attach
//! before activation without missing events.
//!
//! Delivery holds a read guard on the stream's gate for the whole fan-out and
//! [`Connection::disconnect`] takes the write side, so once disconnect returns
//! no subscriber will see another event, even when the host keeps publishing
//! from other threads. Subscribers must not connect or disconnect the stream
//! they are being called from.

use futures::Stream;
use parking_lot::RwLock;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

enum Sink<T> {
    Callback(Callback<T>),
    Channel(mpsc::UnboundedSender<T>),
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        match self {
            Sink::Callback(callback) => Sink::Callback(callback.clone()),
            Sink::Channel(tx) => Sink::Channel(tx.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct Gate {
    connected: bool,
    generation: u64,
    completed: bool,
}

struct Inner<T> {
    name: String,
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(u64, Sink<T>)>>,
    gate: RwLock<Gate>,
}

/// Type-erased handle used by [`Subscription`] and [`Connection`].
trait Detach: Send + Sync {
    fn detach(&self, id: u64);
    fn disconnect(&self, generation: u64) -> bool;
}

impl<T: Send + 'static> Detach for Inner<T> {
    fn detach(&self, id: u64) {
        self.subscribers.write().retain(|(sub_id, _)| *sub_id != id);
    }

    fn disconnect(&self, generation: u64) -> bool {
        // Waits for every delivery in flight to finish.
        let mut gate = self.gate.write();
        if gate.connected && gate.generation == generation {
            gate.connected = false;
            tracing::debug!(stream = %self.name, "Stream disconnected");
            true
        } else {
            false
        }
    }
}

/// Connect-on-demand multicast stream
pub struct Multicast<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Multicast<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Multicast<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                next_id: AtomicU64::new(1),
                subscribers: RwLock::new(Vec::new()),
                gate: RwLock::new(Gate::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Registers a callback invoked synchronously, on the publishing thread,
    /// for every event delivered while the stream is connected.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.attach(Sink::Callback(Arc::new(callback)))
    }

    /// Subscribes through an unbounded channel. The returned stream ends once
    /// the multicast is completed or dropped.
    pub fn subscribe_stream(&self) -> EventStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        // held until the sender is attached so complete() cannot slip in between
        let gate = self.inner.gate.read();
        let subscription = if gate.completed {
            // tx is dropped here so the stream ends on first poll
            Subscription::detached()
        } else {
            self.attach(Sink::Channel(tx))
        };
        drop(gate);
        EventStream {
            subscription,
            events: UnboundedReceiverStream::new(rx),
        }
    }

    fn attach(&self, sink: Sink<T>) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.write().push((id, sink));
        let owner: Weak<dyn Detach> = Arc::downgrade(&self.inner) as Weak<dyn Detach>;
        Subscription {
            owner: Some(owner),
            id,
        }
    }

    /// Starts event flow. Connecting an already connected stream returns a
    /// handle to the existing connection.
    #[must_use = "dropping the connection disconnects the stream"]
    pub fn connect(&self) -> Connection {
        let mut gate = self.inner.gate.write();
        if !gate.connected && !gate.completed {
            gate.generation += 1;
            gate.connected = true;
            tracing::debug!(stream = %self.inner.name, generation = gate.generation, "Stream connected");
        }
        let owner: Weak<dyn Detach> = Arc::downgrade(&self.inner) as Weak<dyn Detach>;
        Connection {
            owner: Some(owner),
            generation: gate.generation,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.gate.read().connected
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Delivers `event` to every subscriber. Returns false when the stream is
    /// not connected and the event was dropped.
    pub fn publish(&self, event: T) -> bool {
        let gate = self.inner.gate.read();
        if !gate.connected {
            return false;
        }

        let sinks: Vec<Sink<T>> = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(_, sink)| sink.clone())
            .collect();

        for sink in sinks {
            match sink {
                Sink::Callback(callback) => callback(&event),
                Sink::Channel(tx) => {
                    let _ = tx.send(event.clone());
                }
            }
        }

        drop(gate);
        true
    }

    /// Disconnects for good and drops every subscriber, ending channel
    /// streams. Later connects are ignored.
    pub fn complete(&self) {
        {
            let mut gate = self.inner.gate.write();
            gate.connected = false;
            gate.completed = true;
        }
        let dropped = std::mem::take(&mut *self.inner.subscribers.write());
        tracing::debug!(stream = %self.inner.name, subscribers = dropped.len(), "Stream completed");
    }
}

/// Disposable handle for one subscriber
#[derive(Default)]
pub struct Subscription {
    owner: Option<Weak<dyn Detach>>,
    id: u64,
}

impl Subscription {
    fn detached() -> Self {
        Self::default()
    }

    pub fn unsubscribe(&mut self) {
        if let Some(owner) = self.owner.take().and_then(|weak| weak.upgrade()) {
            owner.detach(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.owner
            .as_ref()
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Disposable handle for an activated stream
pub struct Connection {
    owner: Option<Weak<dyn Detach>>,
    generation: u64,
}

impl Connection {
    /// Stops event flow, waiting for deliveries in flight. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(owner) = self.owner.take().and_then(|weak| weak.upgrade()) {
            owner.disconnect(self.generation);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Channel-backed subscription; unsubscribes when dropped.
pub struct EventStream<T> {
    subscription: Subscription,
    events: UnboundedReceiverStream<T>,
}

impl<T> EventStream<T> {
    pub fn unsubscribe(&mut self) {
        self.subscription.unsubscribe();
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.get_mut().events).poll_next(cx)
    }
}
