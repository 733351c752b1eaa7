//! Event-driven TCP server.
//!
//! One task accepts connections; every accepted connection gets its own read
//! loop task. Lifecycle and message notifications are published through
//! [`ServerEvents`]:
//!
//! - `connected` fires on the accept task, before the connection's read loop
//!   starts, so it always precedes that connection's `received` events.
//! - `received` fires on the connection's read loop, in wire order.
//! - `disconnected` fires on the connection's read loop after its last
//!   `received`, whether the peer closed, a read failed or the server asked
//!   for the close. The connection is out of [`EventServer::clients`] by then.

use crate::config::ServerOptions;
use crate::event::{
    self, Attachment, EventHandler, ServerConnectionEvent, ServerEvents, ServerMessageEvent,
};
use crate::message::Message;
use crate::registry::ConnectionRegistry;
use crate::runtime::{read_messages, BufferSizes, Closed, Connection};
use crate::Error;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Pending connection queue length for the listening socket.
const LISTEN_BACKLOG: i32 = 1024;

/// A client connected to an [`EventServer`].
pub struct ClientConnection {
    id: u64,
    joined_at: i64,
    conn: Connection,
}

impl ClientConnection {
    /// Unique id, assigned in accept order starting at 0.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote endpoint of the client.
    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    /// Accept time in milliseconds since the Unix epoch.
    pub fn joined_at(&self) -> i64 {
        self.joined_at
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr())
            .field("joined_at", &self.joined_at)
            .finish()
    }
}

struct ServerInner {
    bind_addr: SocketAddr,
    sizes: BufferSizes,
    events: Arc<ServerEvents>,
    registry: ConnectionRegistry<ClientConnection>,
    listening: AtomicBool,
    /// Token of the current listening session; child tokens per connection.
    shutdown: Mutex<Option<CancellationToken>>,
    /// Closes once the accept task and every read loop of the current
    /// listening session have finished.
    session_done: Mutex<Option<mpsc::Receiver<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// TCP server publishing connect/disconnect/receive events.
pub struct EventServer {
    inner: Arc<ServerInner>,
}

impl EventServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                bind_addr: options.bind_addr(),
                sizes: BufferSizes::new(
                    options.socket.receive_buffer_size,
                    options.socket.send_buffer_size,
                ),
                events: Arc::new(ServerEvents::default()),
                registry: ConnectionRegistry::new(),
                listening: AtomicBool::new(false),
                shutdown: Mutex::new(None),
                session_done: Mutex::new(None),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// Bind the configured address and start accepting connections.
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, Error> {
        if self
            .inner
            .listening
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyListening);
        }

        let addr = self.inner.bind_addr;
        let bound = create_listener(addr, &self.inner.sizes)
            .and_then(|listener| Ok((listener.local_addr()?, listener)));
        let (local_addr, listener) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.inner.listening.store(false, Ordering::Release);
                return Err(Error::Bind(addr, e));
            }
        };

        let token = CancellationToken::new();
        let (done_tx, done_rx) = mpsc::channel(1);
        *lock(&self.inner.shutdown) = Some(token.clone());
        *lock(&self.inner.session_done) = Some(done_rx);
        *lock(&self.inner.local_addr) = Some(local_addr);

        info!(address = %local_addr, "Server listening");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(accept_loop(inner, listener, token, done_tx));

        Ok(local_addr)
    }

    /// Stop accepting and close every connection.
    ///
    /// The listening socket is closed and each connection has fired
    /// `disconnected` before this returns. The server can be started again
    /// afterwards on the same port; connection ids keep counting up.
    pub async fn stop(&self) {
        let token = lock(&self.inner.shutdown).take();
        let Some(token) = token else {
            return;
        };

        self.inner.listening.store(false, Ordering::Release);
        *lock(&self.inner.local_addr) = None;
        token.cancel();

        // Every read loop holds a child of `token`; all of them wind down.
        let done = lock(&self.inner.session_done).take();
        if let Some(mut done) = done {
            let _ = done.recv().await;
        }
        info!("Server stopped");
    }

    /// Close a client connection from the server side.
    ///
    /// Returns `false` if the connection is not live or is already closing.
    /// When this returns `true`, the connection's `disconnected` event has
    /// fired and it is no longer registered. Calling this from inside an
    /// event callback of the same connection would wait on itself; spawn it
    /// instead.
    pub async fn disconnect(&self, client: &ClientConnection) -> bool {
        if !self.inner.registry.contains(client.id) || !client.conn.request_close() {
            return false;
        }

        debug!(id = client.id, peer = %client.peer_addr(), "Disconnecting client");
        client.conn.closed().await;
        true
    }

    /// Send a message to one client.
    pub async fn send(&self, client: &ClientConnection, message: &Message) -> Result<(), Error> {
        if !self.is_listening() {
            return Err(Error::NotListening);
        }
        client.conn.send(message).await
    }

    /// Send a message to every registered client.
    ///
    /// Returns the clients the message could not be delivered to.
    pub async fn broadcast(&self, message: &Message) -> Vec<(Arc<ClientConnection>, Error)> {
        let mut failures = Vec::new();
        for client in self.clients() {
            if let Err(e) = self.send(&client, message).await {
                failures.push((client, e));
            }
        }
        failures
    }

    /// Snapshot of the currently connected clients, ordered by id.
    pub fn clients(&self) -> Vec<Arc<ClientConnection>> {
        self.inner.registry.snapshot()
    }

    /// Look up a connected client by id.
    pub fn client(&self, id: u64) -> Option<Arc<ClientConnection>> {
        self.inner.registry.get(id)
    }

    pub fn client_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::Acquire)
    }

    /// Address the server is bound to while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }

    pub fn receive_buffer_size(&self) -> usize {
        self.inner.sizes.receive()
    }

    /// Change the receive buffer size of every live and future connection.
    pub fn set_receive_buffer_size(&self, size: usize) {
        self.inner.sizes.set_receive(size);
        self.propagate_buffer_sizes();
    }

    pub fn send_buffer_size(&self) -> usize {
        self.inner.sizes.send()
    }

    /// Change the send buffer size of every live and future connection.
    pub fn set_send_buffer_size(&self, size: usize) {
        self.inner.sizes.set_send(size);
        self.propagate_buffer_sizes();
    }

    /// Subscription points for this server's events.
    pub fn events(&self) -> &ServerEvents {
        &self.inner.events
    }

    /// Subscribe every hook of `handler`.
    pub fn attach<H>(
        &self,
        handler: Arc<H>,
    ) -> Attachment<ServerConnectionEvent, ServerMessageEvent>
    where
        H: EventHandler<ServerConnectionEvent, ServerMessageEvent>,
    {
        event::attach(&self.inner.events, handler)
    }

    fn propagate_buffer_sizes(&self) {
        for client in self.inner.registry.snapshot() {
            client.conn.apply_buffer_sizes(&self.inner.sizes);
        }
    }
}

impl Drop for EventServer {
    fn drop(&mut self) {
        if let Some(token) = lock(&self.inner.shutdown).take() {
            token.cancel();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a non-blocking listener with address reuse and buffer sizes set.
///
/// Accepted sockets inherit the listener's buffer sizes on most platforms;
/// they are applied again per connection anyway.
fn create_listener(addr: SocketAddr, sizes: &BufferSizes) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    sizes.apply(&socket);
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

async fn accept_loop(
    inner: Arc<ServerInner>,
    listener: TcpListener,
    token: CancellationToken,
    done: mpsc::Sender<()>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                if let Err(e) = admit(&inner, stream, &token, &done) {
                    debug!(peer = %addr, error = %e, "Failed to set up connection");
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
    drop(listener);
    debug!("Accept loop stopped");
}

/// Register an accepted stream, announce it and start its read loop.
fn admit(
    inner: &Arc<ServerInner>,
    stream: TcpStream,
    token: &CancellationToken,
    done: &mpsc::Sender<()>,
) -> io::Result<()> {
    let (conn, reader) = Connection::new(stream, &inner.sizes, token.child_token())?;
    let joined_at = chrono::Utc::now().timestamp_millis();
    let client = inner.registry.register(|id| ClientConnection {
        id,
        joined_at,
        conn,
    });

    debug!(id = client.id, peer = %client.peer_addr(), "New connection");
    inner.events.connected.fire(&ServerConnectionEvent {
        connection: Arc::clone(&client),
    });

    tokio::spawn(serve_connection(Arc::clone(inner), client, reader, done.clone()));
    Ok(())
}

async fn serve_connection(
    inner: Arc<ServerInner>,
    client: Arc<ClientConnection>,
    reader: OwnedReadHalf,
    _done: mpsc::Sender<()>,
) {
    let closed = read_messages(reader, &inner.sizes, client.conn.cancel_token(), |message| {
        trace!(id = client.id, bytes = message.len(), "Received message");
        let event = ServerMessageEvent::new(Arc::clone(&client), message);
        inner.events.received.fire(&event);
    })
    .await;

    match &closed {
        Closed::Eof => debug!(id = client.id, "Connection closed by client"),
        Closed::Error(e) => debug!(id = client.id, error = %e, "Connection error"),
        Closed::Cancelled => debug!(id = client.id, "Connection closed by server"),
    }

    client.conn.request_close();
    inner.registry.remove(client.id);
    inner.events.disconnected.fire(&ServerConnectionEvent {
        connection: Arc::clone(&client),
    });
    client.conn.shutdown();
}
