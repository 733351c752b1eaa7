//! tcp-events: command-line front end for the event client and server.
//!
//! Modes:
//! - `server`: listens, logs every event and echoes each message back
//! - `client`: connects, sends stdin lines and prints what comes back

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tcp_events::config::{Config, Mode};
use tcp_events::{
    EventClient, EventHandler, EventServer, Message, ServerConnectionEvent, ServerMessageEvent,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        mode = ?config.mode,
        listen = %config.server.bind_addr(),
        receive_buffer_size = config.server.socket.receive_buffer_size,
        send_buffer_size = config.server.socket.send_buffer_size,
        "Starting tcp-events"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match config.mode {
        Mode::Server => runtime.block_on(run_server(config)),
        Mode::Client => runtime.block_on(run_client(config)),
    }
}

/// Logs connections and echoes every message to its sender.
///
/// Each connection gets one writer task fed by a queue, so echoes leave in
/// the order the messages arrived.
struct Echo {
    server: Weak<EventServer>,
    writers: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
}

impl Echo {
    fn new(server: Weak<EventServer>) -> Self {
        Self {
            server,
            writers: Mutex::new(HashMap::new()),
        }
    }

    fn writers(&self) -> MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<Message>>> {
        self.writers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventHandler<ServerConnectionEvent, ServerMessageEvent> for Echo {
    fn connected(&self, event: &ServerConnectionEvent) {
        let connection = Arc::clone(&event.connection);
        info!(id = connection.id(), peer = %connection.peer_addr(), "Client connected");

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.writers().insert(connection.id(), tx);

        let server = self.server.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(server) = server.upgrade() else {
                    break;
                };
                if let Err(e) = server.send(&connection, &message).await {
                    warn!(id = connection.id(), error = %e, "Echo failed");
                }
            }
        });
    }

    fn disconnected(&self, event: &ServerConnectionEvent) {
        info!(id = event.connection.id(), "Client disconnected");
        self.writers().remove(&event.connection.id());
    }

    fn received(&self, event: &ServerMessageEvent) {
        debug!(id = event.connection.id(), message = %event.message, "Received");
        if let Some(tx) = self.writers().get(&event.connection.id()) {
            let _ = tx.send(event.message.clone());
        }
    }
}

async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Arc::new(EventServer::new(config.server));
    let _echo = server.attach(Arc::new(Echo::new(Arc::downgrade(&server))));

    server.start().await?;
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    server.stop().await;
    Ok(())
}

async fn run_client(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = EventClient::new(config.server.socket);
    client.events().received.subscribe(|e| println!("{}", e.message));
    client
        .events()
        .disconnected
        .subscribe(|e| info!(peer = %e.peer_addr, "Disconnected"));

    client.connect(config.connect).await?;
    info!(peer = %config.connect, "Connected");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !client.is_connected() {
            break;
        }
        client.send(&Message::from_text(&line)).await?;
    }

    if client.is_connected() {
        client.disconnect().await?;
    }
    Ok(())
}
