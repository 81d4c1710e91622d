//! Ordered publish-subscribe fan-out for fabric events.
//!
//! Publishers enqueue; a single dispatch task invokes subscribers in
//! registration order. Subscriber errors are logged and discarded so a broken
//! listener can never disturb the emitter.

use super::events::{EventKind, FabricEvent};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Synchronous subscriber callback. Return `Err` to have the failure logged.
pub type Listener = Arc<dyn Fn(&FabricEvent) -> Result<(), ListenerError> + Send + Sync>;

type BoxSinkFn = Box<dyn FnMut(FabricEvent) -> BoxFuture<'static, ()> + Send>;

struct Registered {
    id: u64,
    kind: EventKind,
    listener: Listener,
}

enum Envelope {
    Event(FabricEvent),
    Flush(oneshot::Sender<()>),
}

struct BusInner {
    listeners: Mutex<Vec<Registered>>,
    next_id: AtomicU64,
    tx: mpsc::Sender<Envelope>,
    sink_tx: mpsc::UnboundedSender<BoxSinkFn>,
    dropped: AtomicU64,
}

/// Handle returned by [`EventBus::subscribe`]; call [`Subscription::unsubscribe`]
/// to remove the listener. Dropping the handle keeps the subscription alive.
pub struct Subscription {
    id: u64,
    inner: Arc<BusInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let mut listeners =
            self.inner.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.retain(|r| r.id != self.id);
    }
}

/// Shared fan-out bus. Cheap to clone; all clones feed one dispatch task.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("dropped", &self.dropped()).finish()
    }
}

impl EventBus {
    /// Create a bus with the default queue capacity.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a bus whose pending-event queue holds at most `capacity` events.
    /// Must be called within a tokio runtime; the dispatch task is spawned here.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Envelope>(capacity.max(1));
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<BoxSinkFn>();
        let inner = Arc::new(BusInner {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            tx,
            sink_tx,
            dropped: AtomicU64::new(0),
        });

        let dispatch = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut sinks: Vec<BoxSinkFn> = Vec::new();
            while let Some(envelope) = rx.recv().await {
                while let Ok(sink) = sink_rx.try_recv() {
                    sinks.push(sink);
                }
                match envelope {
                    Envelope::Event(event) => {
                        let listeners: Vec<(EventKind, Listener)> = match dispatch.upgrade() {
                            Some(inner) => inner
                                .listeners
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner())
                                .iter()
                                .map(|r| (r.kind, r.listener.clone()))
                                .collect(),
                            None => break,
                        };
                        for (kind, listener) in listeners {
                            if kind.matches(&event) {
                                if let Err(err) = listener(&event) {
                                    tracing::warn!(%event, error = %err, "event listener failed");
                                }
                            }
                        }
                        for sink in sinks.iter_mut() {
                            sink(event.clone()).await;
                        }
                    }
                    Envelope::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });

        Self { inner }
    }

    /// Register a listener for `kind`; listeners fire in registration order.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&FabricEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners =
            self.inner.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.push(Registered { id, kind, listener: Arc::new(listener) });
        Subscription { id, inner: self.inner.clone() }
    }

    /// Attach an async telemetry sink; every event is forwarded to it after
    /// the synchronous listeners have run.
    pub fn attach_sink<S>(&self, sink: S)
    where
        S: tower::Service<FabricEvent, Response = ()> + Clone + Send + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let forward: BoxSinkFn = Box::new(move |event: FabricEvent| {
            let sink = sink.clone();
            Box::pin(super::sinks::emit_best_effort(sink, event)) as BoxFuture<'static, ()>
        });
        let _ = self.inner.sink_tx.send(forward);
    }

    /// Enqueue an event. Never blocks; events are dropped (and counted) when
    /// the queue is full.
    pub fn emit(&self, event: FabricEvent) {
        if self.inner.tx.try_send(Envelope::Event(event)).is_err() {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Wait until every event enqueued before this call has been dispatched.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.inner.tx.send(Envelope::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn listeners_fire_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe(EventKind::All, move |_| {
                order.lock().unwrap().push(tag);
                Ok(())
            });
        }

        bus.emit(FabricEvent::BudgetExhausted { service: "db".into() });
        bus.flush().await;

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn kind_filter_applies() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        bus.subscribe(EventKind::BudgetLow, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(FabricEvent::BudgetExhausted { service: "db".into() });
        bus.emit(FabricEvent::BudgetLow { service: "db".into(), remaining_fraction: 0.05 });
        bus.flush().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listener_errors_are_swallowed() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::All, |_| Err("listener exploded".into()));
        let hits_clone = hits.clone();
        bus.subscribe(EventKind::All, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(FabricEvent::BudgetExhausted { service: "db".into() });
        bus.flush().await;

        // The failing listener did not stop delivery to the next one.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_listener() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let sub = bus.subscribe(EventKind::All, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(FabricEvent::BudgetExhausted { service: "a".into() });
        bus.flush().await;
        sub.unsubscribe();
        bus.emit(FabricEvent::BudgetExhausted { service: "b".into() });
        bus.flush().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
