//! tcp-events: event-driven messaging over TCP.
//!
//! Turns a byte stream into discrete messages and reports connection
//! lifecycle through subscriber callbacks, on both ends:
//!
//! - [`EventServer`]: accepts connections, tracks them by ascending id,
//!   sends to one or all clients
//! - [`EventClient`]: owns one outbound connection
//! - [`Message`]: payload type, optionally split into text parts
//!
//! ## Wire Format
//!
//! ```text
//! <payload bytes> 0x03
//! ```
//!
//! Parts inside a payload are joined with `0xFF`. Payloads may not contain
//! `0x03`; sending one fails with [`Error::ReservedByte`].
//!
//! ## Example
//!
//! ```no_run
//! use tcp_events::{EventServer, Message, ServerOptions};
//!
//! # async fn run() -> Result<(), tcp_events::Error> {
//! let server = EventServer::new(ServerOptions::default());
//! server.events().received.subscribe(|e| {
//!     println!("{} says {}", e.connection.id(), e.message);
//! });
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
mod registry;
mod runtime;
pub mod server;

pub use client::EventClient;
pub use config::{ServerOptions, SocketOptions};
pub use error::Error;
pub use event::{
    Attachment, ClientConnectionEvent, ClientEvents, ClientMessageEvent, EventHandler, Events,
    ServerConnectionEvent, ServerEvents, ServerMessageEvent, SubscriptionId, Subscribers,
};
pub use message::Message;
pub use server::{ClientConnection, EventServer};
