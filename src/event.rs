//! In-process publish/subscribe for connection lifecycle events.
//!
//! Each event kind keeps an ordered list of subscribers. Firing calls every
//! subscriber synchronously, in registration order, on the task that
//! detected the event. A subscriber that panics is logged and skipped; the
//! remaining subscribers still see the event.

use crate::message::Message;
use crate::server::ClientConnection;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::error;

/// Handle returned by [`Subscribers::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered subscriber list for one event kind.
pub struct Subscribers<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(SubscriptionId, Callback<E>)>>,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<E> Subscribers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. It runs after every callback registered before it.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.lock();
        match entries.iter().position(|(entry_id, _)| *entry_id == id) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Deliver `event` to every current subscriber.
    ///
    /// The list is snapshotted first, so callbacks may subscribe or
    /// unsubscribe without deadlocking.
    pub(crate) fn fire(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!("Event subscriber panicked");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Callback<E>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The three subscription points exposed by a client or server.
pub struct Events<C, M> {
    pub connected: Subscribers<C>,
    pub disconnected: Subscribers<C>,
    pub received: Subscribers<M>,
}

impl<C, M> Default for Events<C, M> {
    fn default() -> Self {
        Self {
            connected: Subscribers::new(),
            disconnected: Subscribers::new(),
            received: Subscribers::new(),
        }
    }
}

/// Events published by an [`EventClient`](crate::EventClient).
pub type ClientEvents = Events<ClientConnectionEvent, ClientMessageEvent>;

/// Events published by an [`EventServer`](crate::EventServer).
pub type ServerEvents = Events<ServerConnectionEvent, ServerMessageEvent>;

/// An object reacting to all three event kinds at once.
///
/// Every hook defaults to doing nothing.
pub trait EventHandler<C, M>: Send + Sync + 'static {
    fn connected(&self, _event: &C) {}
    fn disconnected(&self, _event: &C) {}
    fn received(&self, _event: &M) {}
}

/// Subscribe all hooks of `handler` to `events`.
pub fn attach<C, M, H>(events: &Arc<Events<C, M>>, handler: Arc<H>) -> Attachment<C, M>
where
    C: 'static,
    M: 'static,
    H: EventHandler<C, M>,
{
    let h = Arc::clone(&handler);
    let connected = events.connected.subscribe(move |e| h.connected(e));
    let h = Arc::clone(&handler);
    let disconnected = events.disconnected.subscribe(move |e| h.disconnected(e));
    let received = events.received.subscribe(move |e| handler.received(e));

    Attachment {
        events: Arc::downgrade(events),
        connected,
        disconnected,
        received,
    }
}

/// Registration of an [`EventHandler`]. Dropping it keeps the handler
/// subscribed; call [`detach`](Self::detach) to remove it.
pub struct Attachment<C, M> {
    events: Weak<Events<C, M>>,
    connected: SubscriptionId,
    disconnected: SubscriptionId,
    received: SubscriptionId,
}

impl<C, M> Attachment<C, M> {
    /// Unsubscribe every hook of the attached handler.
    pub fn detach(self) {
        if let Some(events) = self.events.upgrade() {
            events.connected.unsubscribe(self.connected);
            events.disconnected.unsubscribe(self.disconnected);
            events.received.unsubscribe(self.received);
        }
    }
}

/// Client-side connect/disconnect notification.
#[derive(Debug, Clone)]
pub struct ClientConnectionEvent {
    /// Remote endpoint of the server.
    pub peer_addr: SocketAddr,
}

/// Message received by a client.
#[derive(Debug, Clone)]
pub struct ClientMessageEvent {
    pub message: Message,
}

/// Server-side connect/disconnect notification.
#[derive(Debug, Clone)]
pub struct ServerConnectionEvent {
    pub connection: Arc<ClientConnection>,
}

/// Message received by a server from one of its clients.
#[derive(Debug, Clone)]
pub struct ServerMessageEvent {
    /// Connection the message arrived on.
    pub connection: Arc<ClientConnection>,
    pub message: Message,
    /// Receipt time in milliseconds since the Unix epoch.
    pub received_at: i64,
}

impl ServerMessageEvent {
    pub(crate) fn new(connection: Arc<ClientConnection>, message: Message) -> Self {
        Self {
            connection,
            message,
            received_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}
