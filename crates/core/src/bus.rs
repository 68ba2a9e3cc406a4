//! SystemBus: typed, filterable publish/subscribe.
//!
//! Dispatch is synchronous: `emit` runs every matching handler inline on the
//! caller's task, highest priority first and in subscription order among
//! equal priorities. The subscription list is copy-on-write, so handlers may
//! subscribe, unsubscribe or emit while a dispatch is in progress. A handler
//! that panics is logged and skipped; the publisher never sees the failure.
//!
//! The optional queued backend puts a bounded queue in front of the same
//! dispatcher. `publish` waits for queue space up to a timeout and then fails
//! with [`BusError::QueueFull`]; a background task drains the queue between
//! [`SystemBus::start`] and [`SystemBus::stop`].
//!
//! Producers and consumers can be handed capability-restricted views
//! ([`BusProducer`], [`BusConsumer`]) instead of the bus itself.

use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, warn};

use crate::error::BusError;
use crate::event::{EventType, SystemEvent};

/// A subscriber callback.
pub type EventHandler = Arc<dyn Fn(&SystemEvent) + Send + Sync>;

/// Extra per-event predicate checked after the type filter.
pub type EventPredicate = Arc<dyn Fn(&SystemEvent) -> bool + Send + Sync>;

/// Which event types a subscription receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EventFilter {
    /// Every event
    #[default]
    Any,
    Type(EventType),
    Types(Vec<EventType>),
}

impl EventFilter {
    pub fn matches(&self, event_type: EventType) -> bool {
        match self {
            Self::Any => true,
            Self::Type(t) => *t == event_type,
            Self::Types(types) => types.contains(&event_type),
        }
    }
}

impl From<EventType> for EventFilter {
    fn from(t: EventType) -> Self {
        Self::Type(t)
    }
}

impl From<Vec<EventType>> for EventFilter {
    fn from(types: Vec<EventType>) -> Self {
        Self::Types(types)
    }
}

impl From<&[EventType]> for EventFilter {
    fn from(types: &[EventType]) -> Self {
        Self::Types(types.to_vec())
    }
}

impl<const N: usize> From<[EventType; N]> for EventFilter {
    fn from(types: [EventType; N]) -> Self {
        Self::Types(types.to_vec())
    }
}

/// Options for a subscription.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub filter: Option<EventPredicate>,

    /// Higher runs first
    pub priority: i32,

    /// Unsubscribe after the first dispatch
    pub once: bool,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn with_filter(
        mut self,
        filter: impl Fn(&SystemEvent) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Only events whose context names `agent_id`.
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self::new().with_filter(move |e| e.agent_id() == Some(agent_id.as_str()))
    }

    /// Only events whose context names `session_id`.
    pub fn for_session(session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        Self::new().with_filter(move |e| e.session_id() == Some(session_id.as_str()))
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("filter", &self.filter.is_some())
            .field("priority", &self.priority)
            .field("once", &self.once)
            .finish()
    }
}

/// Backend selection for [`SystemBus::with_backend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusBackend {
    /// Inline dispatch on the emitting task
    Sync,
    /// Bounded queue drained by a background task
    Queued {
        capacity: usize,
        publish_timeout: Duration,
    },
}

struct Subscription {
    id: u64,
    types: EventFilter,
    handler: EventHandler,
    predicate: Option<EventPredicate>,
    priority: i32,
    once: bool,
    active: AtomicBool,
}

struct QueueBackend {
    capacity: usize,
    publish_timeout: Duration,
    sender: mpsc::Sender<SystemEvent>,
    /// Parked receiver while the dispatch loop is stopped
    receiver: Mutex<Option<mpsc::Receiver<SystemEvent>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<mpsc::Receiver<SystemEvent>>>>,
}

struct BusInner {
    subscriptions: Mutex<Arc<Vec<Arc<Subscription>>>>,
    next_id: AtomicU64,
    destroyed: AtomicBool,
    queue: Option<QueueBackend>,
}

impl BusInner {
    fn subscribe(
        &self,
        types: EventFilter,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let sub = Arc::new(Subscription {
            id,
            types,
            handler,
            predicate: options.filter,
            priority: options.priority,
            once: options.once,
            active: AtomicBool::new(true),
        });

        let mut guard = self.subscriptions.lock();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        let pos = next
            .iter()
            .position(|s| s.priority < sub.priority)
            .unwrap_or(next.len());
        next.insert(pos, sub);
        *guard = Arc::new(next);
        id
    }

    fn remove(&self, id: u64) {
        let mut guard = self.subscriptions.lock();
        if let Some(sub) = guard.iter().find(|s| s.id == id) {
            sub.active.store(false, Ordering::Release);
            let next: Vec<_> = guard.iter().filter(|s| s.id != id).cloned().collect();
            *guard = Arc::new(next);
        }
    }

    fn dispatch(&self, event: &SystemEvent) {
        let snapshot = Arc::clone(&self.subscriptions.lock());
        let event_type = event.event_type();

        for sub in snapshot.iter() {
            if self.destroyed.load(Ordering::Acquire) {
                break;
            }
            if !sub.active.load(Ordering::Acquire) || !sub.types.matches(event_type) {
                continue;
            }
            if let Some(predicate) = &sub.predicate {
                match catch_unwind(AssertUnwindSafe(|| predicate(event))) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(panic) => {
                        error!(
                            event_type = %event_type,
                            subscription = sub.id,
                            "Event filter panicked: {}",
                            panic_message(panic.as_ref())
                        );
                        continue;
                    }
                }
            }
            if sub.once {
                if sub
                    .active
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                self.remove(sub.id);
            }

            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (sub.handler)(event))) {
                error!(
                    event_type = %event_type,
                    subscription = sub.id,
                    "Event handler panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle returned by every subscription call.
///
/// Calling [`unsubscribe`](Self::unsubscribe) more than once is harmless.
/// Dropping the handle does not unsubscribe.
#[derive(Debug, Clone)]
pub struct Unsubscribe {
    bus: Weak<BusInner>,
    id: u64,
}

impl Unsubscribe {
    fn noop() -> Self {
        Self {
            bus: Weak::new(),
            id: 0,
        }
    }

    pub fn unsubscribe(&self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(self.id);
        }
    }
}

impl fmt::Debug for BusInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusInner")
            .field("subscriptions", &self.subscriptions.lock().len())
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .field("queued", &self.queue.is_some())
            .finish()
    }
}

/// The event bus. Cloning yields another handle to the same bus.
#[derive(Debug, Clone)]
pub struct SystemBus {
    inner: Arc<BusInner>,
}

impl SystemBus {
    /// A bus with inline dispatch.
    pub fn new() -> Self {
        Self::with_backend(BusBackend::Sync)
    }

    /// A bus with a bounded queue in front of dispatch.
    ///
    /// Nothing is delivered until [`start`](Self::start) is called.
    pub fn queued(capacity: usize, publish_timeout: Duration) -> Self {
        Self::with_backend(BusBackend::Queued {
            capacity,
            publish_timeout,
        })
    }

    pub fn with_backend(backend: BusBackend) -> Self {
        let queue = match backend {
            BusBackend::Sync => None,
            BusBackend::Queued {
                capacity,
                publish_timeout,
            } => {
                let capacity = capacity.max(1);
                let (sender, receiver) = mpsc::channel(capacity);
                Some(QueueBackend {
                    capacity,
                    publish_timeout,
                    sender,
                    receiver: Mutex::new(Some(receiver)),
                    shutdown: Mutex::new(None),
                    task: Mutex::new(None),
                })
            }
        };
        Self {
            inner: Arc::new(BusInner {
                subscriptions: Mutex::new(Arc::new(Vec::new())),
                next_id: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
                queue,
            }),
        }
    }

    // --- Producing ---

    /// Deliver an event to every matching subscription.
    ///
    /// With the queued backend the event is enqueued without waiting; if the
    /// queue is full it is dropped with a warning (use [`publish`](Self::publish)
    /// for backpressure).
    pub fn emit(&self, event: SystemEvent) {
        if self.is_destroyed() {
            return;
        }
        match &self.inner.queue {
            None => self.inner.dispatch(&event),
            Some(queue) => {
                if let Err(e) = queue.sender.try_send(event) {
                    match e {
                        mpsc::error::TrySendError::Full(event) => warn!(
                            event_type = %event.event_type(),
                            capacity = queue.capacity,
                            "Event queue full, dropping event"
                        ),
                        mpsc::error::TrySendError::Closed(_) => {
                            debug!("Event queue closed, dropping event")
                        }
                    }
                }
            }
        }
    }

    /// Emit each event in order.
    pub fn emit_batch(&self, events: impl IntoIterator<Item = SystemEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Emit with backpressure.
    ///
    /// On the queued backend this waits for queue space for up to the
    /// configured publish timeout. On the sync backend it dispatches inline.
    pub async fn publish(&self, event: SystemEvent) -> Result<(), BusError> {
        if self.is_destroyed() {
            return Err(BusError::Closed);
        }
        match &self.inner.queue {
            None => {
                self.inner.dispatch(&event);
                Ok(())
            }
            Some(queue) => queue
                .sender
                .send_timeout(event, queue.publish_timeout)
                .await
                .map_err(|e| match e {
                    mpsc::error::SendTimeoutError::Timeout(_) => BusError::QueueFull {
                        capacity: queue.capacity,
                    },
                    mpsc::error::SendTimeoutError::Closed(_) => BusError::Closed,
                }),
        }
    }

    // --- Consuming ---

    /// Subscribe `handler` to events matching `filter`.
    pub fn on(
        &self,
        filter: impl Into<EventFilter>,
        handler: impl Fn(&SystemEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.on_with(filter, handler, SubscribeOptions::default())
    }

    pub fn on_with(
        &self,
        filter: impl Into<EventFilter>,
        handler: impl Fn(&SystemEvent) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> Unsubscribe {
        if self.is_destroyed() {
            return Unsubscribe::noop();
        }
        let id = self
            .inner
            .subscribe(filter.into(), Arc::new(handler), options);
        Unsubscribe {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Subscribe to every event.
    pub fn on_any(&self, handler: impl Fn(&SystemEvent) + Send + Sync + 'static) -> Unsubscribe {
        self.on(EventFilter::Any, handler)
    }

    /// Subscribe for a single matching event.
    pub fn once(
        &self,
        filter: impl Into<EventFilter>,
        handler: impl Fn(&SystemEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.on_with(filter, handler, SubscribeOptions::new().once())
    }

    /// Receive matching events as an async stream.
    ///
    /// The subscription ends when the stream is dropped.
    pub fn stream(&self, filter: impl Into<EventFilter>, options: SubscribeOptions) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let unsubscribe = self.on_with(
            filter,
            move |event| {
                let _ = tx.send(event.clone());
            },
            options,
        );
        EventStream {
            inner: UnboundedReceiverStream::new(rx),
            unsubscribe,
        }
    }

    // --- Views ---

    /// A handle that can only emit.
    pub fn as_producer(&self) -> BusProducer {
        BusProducer { bus: self.clone() }
    }

    /// A handle that can only subscribe.
    pub fn as_consumer(&self) -> BusConsumer {
        BusConsumer { bus: self.clone() }
    }

    // --- Lifecycle ---

    /// Start the queued dispatch loop. Idempotent; a no-op on the sync backend.
    ///
    /// Requires a Tokio runtime.
    pub fn start(&self) -> Result<(), BusError> {
        if self.is_destroyed() {
            return Err(BusError::Closed);
        }
        let Some(queue) = &self.inner.queue else {
            return Ok(());
        };
        let mut task = queue.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }
        let Some(mut receiver) = queue.receiver.lock().take() else {
            return Err(BusError::NotRunning);
        };
        let handle = tokio::runtime::Handle::try_current().map_err(|_| BusError::NotRunning)?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let weak = Arc::downgrade(&self.inner);
        *queue.shutdown.lock() = Some(shutdown_tx);
        *task = Some(handle.spawn(async move {
            debug!("Event dispatch loop started");
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    next = receiver.recv() => {
                        let Some(event) = next else { break };
                        let Some(inner) = weak.upgrade() else { break };
                        inner.dispatch(&event);
                    }
                }
            }
            debug!("Event dispatch loop stopped");
            receiver
        }));
        Ok(())
    }

    /// Stop the queued dispatch loop, keeping undelivered events queued.
    pub async fn stop(&self) {
        let Some(queue) = &self.inner.queue else {
            return;
        };
        if let Some(shutdown) = queue.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        let task = queue.task.lock().take();
        if let Some(task) = task {
            match task.await {
                Ok(receiver) => *queue.receiver.lock() = Some(receiver),
                Err(e) => warn!("Event dispatch loop ended abnormally: {e}"),
            }
        }
    }

    /// Whether events are currently being delivered.
    pub fn is_running(&self) -> bool {
        if self.is_destroyed() {
            return false;
        }
        match &self.inner.queue {
            None => true,
            Some(queue) => queue
                .task
                .lock()
                .as_ref()
                .is_some_and(|t| !t.is_finished()),
        }
    }

    /// Number of queued, undelivered events (always 0 on the sync backend).
    pub fn pending(&self) -> usize {
        self.inner
            .queue
            .as_ref()
            .map_or(0, |q| q.sender.max_capacity() - q.sender.capacity())
    }

    /// Drop every subscription. Later `emit`/`on` calls are no-ops. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let old = std::mem::take(&mut *self.inner.subscriptions.lock());
        for sub in old.iter() {
            sub.active.store(false, Ordering::Release);
        }
        if let Some(queue) = &self.inner.queue {
            if let Some(shutdown) = queue.shutdown.lock().take() {
                let _ = shutdown.send(());
            }
        }
        debug!("Event bus destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }
}

impl Default for SystemBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Emit-only view of a [`SystemBus`].
#[derive(Debug, Clone)]
pub struct BusProducer {
    bus: SystemBus,
}

impl BusProducer {
    pub fn emit(&self, event: SystemEvent) {
        self.bus.emit(event);
    }

    pub fn emit_batch(&self, events: impl IntoIterator<Item = SystemEvent>) {
        self.bus.emit_batch(events);
    }

    pub async fn publish(&self, event: SystemEvent) -> Result<(), BusError> {
        self.bus.publish(event).await
    }
}

/// Subscribe-only view of a [`SystemBus`].
#[derive(Debug, Clone)]
pub struct BusConsumer {
    bus: SystemBus,
}

impl BusConsumer {
    pub fn on(
        &self,
        filter: impl Into<EventFilter>,
        handler: impl Fn(&SystemEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.bus.on(filter, handler)
    }

    pub fn on_with(
        &self,
        filter: impl Into<EventFilter>,
        handler: impl Fn(&SystemEvent) + Send + Sync + 'static,
        options: SubscribeOptions,
    ) -> Unsubscribe {
        self.bus.on_with(filter, handler, options)
    }

    pub fn on_any(&self, handler: impl Fn(&SystemEvent) + Send + Sync + 'static) -> Unsubscribe {
        self.bus.on_any(handler)
    }

    pub fn once(
        &self,
        filter: impl Into<EventFilter>,
        handler: impl Fn(&SystemEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.bus.once(filter, handler)
    }

    pub fn stream(&self, filter: impl Into<EventFilter>, options: SubscribeOptions) -> EventStream {
        self.bus.stream(filter, options)
    }
}

/// Async stream of bus events; unsubscribes when dropped.
#[derive(Debug)]
pub struct EventStream {
    inner: UnboundedReceiverStream<SystemEvent>,
    unsubscribe: Unsubscribe,
}

impl Stream for EventStream {
    type Item = SystemEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.unsubscribe.unsubscribe();
    }
}
