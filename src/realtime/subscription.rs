#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_stream::stream;
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use super::connection::Outbox;
use super::types::request::{ClientMessage, Outbound};
use super::types::response::{ChangeEvent, EventKind};
use crate::Result;
#[cfg(feature = "tracing")]
use crate::ws::listeners::panic_message;

/// Callback invoked for each matching event.
pub type Handler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Identifies a registered handler so it can be removed with [`Subscription::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Options applied when a subscription is first created.
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    /// Filter forwarded to the server on every subscribe frame
    pub filter: Option<Value>,
    /// Requested event kind, kept for callers that inspect it
    pub event: Option<EventKind>,
}

impl ChannelOptions {
    #[must_use]
    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn with_event(mut self, event: EventKind) -> Self {
        self.event = Some(event);
        self
    }
}

/// Desired subscription state for one topic, plus its registered handlers.
///
/// Cloning yields another handle to the same subscription. Subscriptions are created by
/// [`super::ConnectionManager::channel`] and live as long as the manager; their state
/// survives reconnects.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

struct Inner {
    topic: String,
    event: Option<EventKind>,
    filter: RwLock<Option<Value>>,
    subscribed: AtomicBool,
    next_handler: AtomicU64,
    handlers: Mutex<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
    outbox: Outbox,
}

impl Subscription {
    pub(crate) fn new(topic: String, options: ChannelOptions, outbox: Outbox) -> Self {
        Self {
            inner: Arc::new(Inner {
                topic,
                event: options.event,
                filter: RwLock::new(options.filter),
                subscribed: AtomicBool::new(false),
                next_handler: AtomicU64::new(0),
                handlers: Mutex::new(HashMap::new()),
                outbox,
            }),
        }
    }

    /// Fully-qualified topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Requested event kind given at creation.
    #[must_use]
    pub fn event(&self) -> Option<EventKind> {
        self.inner.event
    }

    /// Filter sent with subscribe frames.
    #[must_use]
    pub fn filter(&self) -> Option<Value> {
        // Recover from poisoning: Option<Value> has no inconsistent intermediate state.
        self.inner
            .filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the stored filter.
    ///
    /// When subscribed, a subscribe frame carrying the new filter is sent right away.
    /// Otherwise the filter goes out with the next [`Subscription::subscribe`]. Frames sent
    /// after a reconnect always use the latest filter.
    pub fn set_filter(&self, filter: Option<Value>) -> Result<()> {
        *self
            .inner
            .filter
            .write()
            .unwrap_or_else(PoisonError::into_inner) = filter.clone();

        if !self.is_subscribed() {
            return Ok(());
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(topic = %self.inner.topic, "Updating subscription filter");

        self.inner
            .outbox
            .send(ClientMessage::subscribe(self.inner.topic.clone(), filter).into())
    }

    /// Whether the subscription is currently requested.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.inner.subscribed.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same subscription.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register `handler` for events of `kind`. [`EventKind::All`] receives every event.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        self.lock_handlers()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Register `handler` for every event on this topic.
    pub fn on_any<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.on(EventKind::All, handler)
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.lock_handlers();
        let mut removed = false;
        for registered in handlers.values_mut() {
            let before = registered.len();
            registered.retain(|(handler_id, _)| *handler_id != id);
            removed |= registered.len() != before;
        }
        handlers.retain(|_, registered| !registered.is_empty());
        removed
    }

    /// Number of registered handlers across all kinds.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.lock_handlers().values().map(Vec::len).sum()
    }

    /// Stream of events of `kind`.
    ///
    /// The stream ends when [`Subscription::unsubscribe`] clears the handlers.
    pub fn events(&self, kind: EventKind) -> impl Stream<Item = ChangeEvent> + use<> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.on(kind, move |event| {
            _ = tx.send(event.clone());
        });

        stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }
    }

    /// Request events for this topic.
    ///
    /// A no-op when already subscribed. Otherwise sends a subscribe frame, queued until
    /// the connection is up.
    pub fn subscribe(&self) -> Result<()> {
        if self.inner.subscribed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(topic = %self.inner.topic, "Subscribing to topic");

        let message = ClientMessage::subscribe(self.inner.topic.clone(), self.filter());
        if let Err(e) = self.inner.outbox.send(Outbound::Channel(message)) {
            self.inner.subscribed.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Stop events for this topic and drop every registered handler.
    pub fn unsubscribe(&self) -> Result<()> {
        self.inner.subscribed.store(false, Ordering::Release);
        self.lock_handlers().clear();

        #[cfg(feature = "tracing")]
        tracing::debug!(topic = %self.inner.topic, "Unsubscribing from topic");

        self.inner
            .outbox
            .send(ClientMessage::unsubscribe(self.inner.topic.clone()).into())
    }

    /// Invoke the handlers for `kind` and the wildcard handlers with `event`.
    ///
    /// Handlers run outside the registry lock, so they may register, remove or
    /// unsubscribe; such changes apply to later events. A panicking handler is logged
    /// and does not stop delivery to the rest. Returns the number of handlers that
    /// completed.
    pub(crate) fn dispatch(&self, kind: EventKind, event: &ChangeEvent) -> usize {
        let selected: Vec<Handler> = {
            let handlers = self.lock_handlers();
            let wildcard = (kind != EventKind::All).then_some(EventKind::All);
            [Some(kind), wildcard]
                .into_iter()
                .flatten()
                .filter_map(|key| handlers.get(&key))
                .flatten()
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        let mut delivered = 0;
        for handler in selected {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        topic = %self.inner.topic,
                        %kind,
                        panic = panic_message(panic.as_ref()),
                        "Subscription handler panicked"
                    );
                    #[cfg(not(feature = "tracing"))]
                    let _ = &panic;
                }
            }
        }
        delivered
    }

    fn lock_handlers(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<(HandlerId, Handler)>>> {
        // Recover from poisoning: handlers never panic while the lock is held.
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.inner.topic)
            .field("event", &self.inner.event)
            .field("subscribed", &self.is_subscribed())
            .field("handlers", &self.handler_count())
            .finish_non_exhaustive()
    }
}
