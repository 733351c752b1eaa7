//! Event-driven TCP client owning a single outbound connection.
//!
//! After a successful [`EventClient::connect`] a read loop task delivers each
//! framed message to the `received` subscribers. The loop also owns
//! teardown: when the server closes the stream, a read fails, or
//! [`EventClient::disconnect`] asks for it, the loop fires `disconnected`
//! and shuts the socket down.

use crate::config::{effective_timeout, SocketOptions};
use crate::event::{
    self, Attachment, ClientConnectionEvent, ClientEvents, ClientMessageEvent, EventHandler,
};
use crate::message::Message;
use crate::runtime::{read_messages, BufferSizes, Closed, Connection};
use crate::Error;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

struct ClientInner {
    sizes: BufferSizes,
    connect_timeout: AtomicI64,
    events: Arc<ClientEvents>,
    connecting: AtomicBool,
    current: Mutex<Option<Arc<Connection>>>,
}

impl ClientInner {
    fn current(&self) -> MutexGuard<'_, Option<Arc<Connection>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The live connection, unless it is closing.
    fn live(&self) -> Option<Arc<Connection>> {
        self.current()
            .as_ref()
            .filter(|conn| !conn.is_closing())
            .cloned()
    }
}

/// TCP client publishing connect/disconnect/receive events.
pub struct EventClient {
    inner: Arc<ClientInner>,
}

impl Default for EventClient {
    fn default() -> Self {
        Self::new(SocketOptions::default())
    }
}

impl EventClient {
    pub fn new(options: SocketOptions) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                sizes: BufferSizes::new(options.receive_buffer_size, options.send_buffer_size),
                connect_timeout: AtomicI64::new(options.connect_timeout),
                events: Arc::new(ClientEvents::default()),
                connecting: AtomicBool::new(false),
                current: Mutex::new(None),
            }),
        }
    }

    /// Connect to `addr`, waiting at most the configured timeout.
    ///
    /// On success `connected` fires before the read loop starts. Fails
    /// without side effects if the client is connected, another attempt is
    /// in flight, or the attempt errors or times out.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), Error> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }
        if self.inner.connecting.swap(true, Ordering::AcqRel) {
            return Err(Error::ConnectInProgress);
        }

        let result = self.establish(addr).await;
        self.inner.connecting.store(false, Ordering::Release);
        result
    }

    async fn establish(&self, addr: SocketAddr) -> Result<(), Error> {
        let limit = self.timeout();
        debug!(peer = %addr, timeout = ?limit, "Connecting");

        let stream = match timeout(limit, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::Connect(addr, e)),
            Err(_) => return Err(Error::ConnectTimeout(addr, limit)),
        };

        let (conn, reader) = Connection::new(stream, &self.inner.sizes, CancellationToken::new())
            .map_err(|e| Error::Connect(addr, e))?;
        let conn = Arc::new(conn);
        *self.inner.current() = Some(Arc::clone(&conn));

        debug!(peer = %conn.peer_addr(), "Connected");
        self.inner.events.connected.fire(&ClientConnectionEvent {
            peer_addr: conn.peer_addr(),
        });

        tokio::spawn(run_connection(Arc::clone(&self.inner), conn, reader));
        Ok(())
    }

    /// Close the connection.
    ///
    /// When this returns `Ok`, `disconnected` has fired and the socket is
    /// shut down. Fails with [`Error::NotConnected`] if there is no live
    /// connection or another close already won.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let conn = self.inner.live().ok_or(Error::NotConnected)?;
        if !conn.request_close() {
            return Err(Error::NotConnected);
        }

        debug!(peer = %conn.peer_addr(), "Disconnecting");
        conn.closed().await;
        Ok(())
    }

    /// Send a message to the server.
    pub async fn send(&self, message: &Message) -> Result<(), Error> {
        let conn = self.inner.live().ok_or(Error::NotConnected)?;
        conn.send(message).await
    }

    /// Whether a connection is live and not being torn down.
    pub fn is_connected(&self) -> bool {
        self.inner.live().is_some()
    }

    /// Remote endpoint of the live connection.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.live().map(|conn| conn.peer_addr())
    }

    /// Effective connect timeout.
    pub fn timeout(&self) -> Duration {
        effective_timeout(self.inner.connect_timeout.load(Ordering::Relaxed))
    }

    /// Set the connect timeout in seconds for future connects.
    /// Values `<= 0` mean one second.
    pub fn set_timeout(&self, secs: i64) {
        self.inner.connect_timeout.store(secs, Ordering::Relaxed);
    }

    pub fn receive_buffer_size(&self) -> usize {
        self.inner.sizes.receive()
    }

    /// Change the receive buffer size, including on the live socket.
    pub fn set_receive_buffer_size(&self, size: usize) {
        self.inner.sizes.set_receive(size);
        self.propagate_buffer_sizes();
    }

    pub fn send_buffer_size(&self) -> usize {
        self.inner.sizes.send()
    }

    /// Change the send buffer size, including on the live socket.
    pub fn set_send_buffer_size(&self, size: usize) {
        self.inner.sizes.set_send(size);
        self.propagate_buffer_sizes();
    }

    /// Subscription points for this client's events.
    pub fn events(&self) -> &ClientEvents {
        &self.inner.events
    }

    /// Subscribe every hook of `handler`.
    pub fn attach<H>(
        &self,
        handler: Arc<H>,
    ) -> Attachment<ClientConnectionEvent, ClientMessageEvent>
    where
        H: EventHandler<ClientConnectionEvent, ClientMessageEvent>,
    {
        event::attach(&self.inner.events, handler)
    }

    fn propagate_buffer_sizes(&self) {
        if let Some(conn) = self.inner.live() {
            conn.apply_buffer_sizes(&self.inner.sizes);
        }
    }
}

impl Drop for EventClient {
    fn drop(&mut self) {
        if let Some(conn) = self.inner.live() {
            conn.request_close();
        }
    }
}

async fn run_connection(inner: Arc<ClientInner>, conn: Arc<Connection>, reader: OwnedReadHalf) {
    let closed = read_messages(reader, &inner.sizes, conn.cancel_token(), |message| {
        trace!(bytes = message.len(), "Received message");
        inner.events.received.fire(&ClientMessageEvent { message });
    })
    .await;

    match &closed {
        Closed::Eof => debug!(peer = %conn.peer_addr(), "Connection closed by server"),
        Closed::Error(e) => debug!(peer = %conn.peer_addr(), error = %e, "Connection error"),
        Closed::Cancelled => debug!(peer = %conn.peer_addr(), "Connection closed locally"),
    }

    conn.request_close();
    inner.events.disconnected.fire(&ClientConnectionEvent {
        peer_addr: conn.peer_addr(),
    });
    conn.shutdown();

    let mut current = inner.current();
    if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &conn)) {
        *current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerOptions;
    use crate::server::EventServer;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, PartialEq)]
    enum Seen {
        Connected,
        Received(String),
        Disconnected,
    }

    fn record(client: &EventClient) -> mpsc::UnboundedReceiver<Seen> {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = client.events();

        let t = tx.clone();
        events.connected.subscribe(move |_| drop(t.send(Seen::Connected)));
        let t = tx.clone();
        events
            .received
            .subscribe(move |e| drop(t.send(Seen::Received(e.message.to_string()))));
        events.disconnected.subscribe(move |_| drop(tx.send(Seen::Disconnected)));
        rx
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_connect_and_receive() {
        let (listener, addr) = listener().await;
        let client = EventClient::default();
        let mut seen = record(&client);

        client.connect(addr).await.unwrap();
        assert!(client.is_connected());
        assert_eq!(client.peer_addr(), Some(addr));
        assert_eq!(next(&mut seen).await, Seen::Connected);

        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"po").await.unwrap();
        peer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.write_all(b"ng\x03").await.unwrap();

        assert_eq!(next(&mut seen).await, Seen::Received("pong".into()));
    }

    #[tokio::test]
    async fn test_send_frames_message() {
        let (listener, addr) = listener().await;
        let client = EventClient::default();
        client.connect(addr).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        client.send(&Message::from_parts(&["a", "b"])).await.unwrap();

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"a\xFFb\x03");
    }

    #[tokio::test]
    async fn test_double_connect_fails() {
        let (_listener, addr) = listener().await;
        let client = EventClient::default();
        client.connect(addr).await.unwrap();
        assert!(matches!(client.connect(addr).await, Err(Error::AlreadyConnected)));
    }

    #[tokio::test]
    async fn test_disconnect() {
        let (listener, addr) = listener().await;
        let client = EventClient::default();
        let mut seen = record(&client);
        client.connect(addr).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        next(&mut seen).await;

        client.disconnect().await.unwrap();
        assert_eq!(next(&mut seen).await, Seen::Disconnected);
        assert!(!client.is_connected());

        assert!(matches!(client.disconnect().await, Err(Error::NotConnected)));
        assert!(matches!(
            client.send(&Message::from_text("late")).await,
            Err(Error::NotConnected)
        ));

        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_server_close_fires_disconnected() {
        let (listener, addr) = listener().await;
        let client = EventClient::default();
        let mut seen = record(&client);
        client.connect(addr).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        next(&mut seen).await;

        peer.write_all(b"bye\x03").await.unwrap();
        drop(peer);

        assert_eq!(next(&mut seen).await, Seen::Received("bye".into()));
        assert_eq!(next(&mut seen).await, Seen::Disconnected);
        assert!(!client.is_connected());

        // The client can reconnect afterwards.
        client.connect(addr).await.unwrap();
        assert_eq!(next(&mut seen).await, Seen::Connected);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, addr) = listener().await;
        drop(listener);

        let client = EventClient::default();
        assert!(matches!(client.connect(addr).await, Err(Error::Connect(..))));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_unreachable_times_out() {
        let client = EventClient::default();
        client.set_timeout(1);
        assert_eq!(client.timeout(), Duration::from_secs(1));

        // Non-routable address: the attempt either hangs until the timeout
        // or fails immediately, depending on the network.
        let started = Instant::now();
        let result = client.connect("10.255.255.1:3000".parse().unwrap()).await;

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_millis(2500));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_timeout_fallback() {
        let client = EventClient::default();
        assert_eq!(client.timeout(), Duration::from_secs(3));
        client.set_timeout(0);
        assert_eq!(client.timeout(), Duration::from_secs(1));
        client.set_timeout(-2);
        assert_eq!(client.timeout(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_buffer_sizes() {
        let (_listener, addr) = listener().await;
        let client = EventClient::new(SocketOptions {
            receive_buffer_size: 1024,
            ..SocketOptions::default()
        });
        assert_eq!(client.receive_buffer_size(), 1024);

        client.connect(addr).await.unwrap();
        let conn = client.inner.live().unwrap();
        let before = conn.receive_buffer_size().unwrap();

        client.set_receive_buffer_size(256 * 1024);
        client.set_send_buffer_size(4096);
        assert_eq!(client.receive_buffer_size(), 256 * 1024);
        assert_eq!(client.send_buffer_size(), 4096);
        assert!(conn.receive_buffer_size().unwrap() > before);
    }

    #[derive(Debug, PartialEq)]
    enum Side {
        Server(String),
        Client(String),
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ping_pong_with_event_server() {
        let server = EventServer::new(ServerOptions {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..ServerOptions::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();

        let t = tx.clone();
        server.events().connected.subscribe(move |e| {
            drop(t.send(Side::Server(format!("connected {}", e.connection.id()))))
        });
        let t = tx.clone();
        server
            .events()
            .received
            .subscribe(move |e| drop(t.send(Side::Server(e.message.to_string()))));
        let t = tx.clone();
        server.events().disconnected.subscribe(move |e| {
            drop(t.send(Side::Server(format!("disconnected {}", e.connection.id()))))
        });

        let addr = server.start().await.unwrap();
        let client = EventClient::default();
        let t = tx.clone();
        client
            .events()
            .connected
            .subscribe(move |_| drop(t.send(Side::Client("connected".into()))));
        let t = tx.clone();
        client
            .events()
            .received
            .subscribe(move |e| drop(t.send(Side::Client(e.message.to_string()))));
        client
            .events()
            .disconnected
            .subscribe(move |_| drop(tx.send(Side::Client("disconnected".into()))));

        client.connect(addr).await.unwrap();
        let mut connected = vec![next(&mut rx).await, next(&mut rx).await];
        connected.sort_by_key(|s| matches!(s, Side::Client(_)));
        assert_eq!(
            connected,
            vec![
                Side::Server("connected 0".into()),
                Side::Client("connected".into())
            ]
        );

        client.send(&Message::from_text("ping")).await.unwrap();
        assert_eq!(next(&mut rx).await, Side::Server("ping".into()));

        let conn = server.client(0).unwrap();
        server.send(&conn, &Message::from_text("pong")).await.unwrap();
        assert_eq!(next(&mut rx).await, Side::Client("pong".into()));

        client.disconnect().await.unwrap();
        assert_eq!(next(&mut rx).await, Side::Client("disconnected".into()));
        assert_eq!(next(&mut rx).await, Side::Server("disconnected 0".into()));
        assert!(server.clients().is_empty());
    }
}
