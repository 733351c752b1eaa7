//! Error type shared by the client and server.

use std::net::SocketAddr;
use std::time::Duration;

/// Errors reported by [`EventClient`](crate::EventClient) and
/// [`EventServer`](crate::EventServer) operations.
#[derive(Debug)]
pub enum Error {
    /// `connect` was called while a connection is live.
    AlreadyConnected,
    /// Another `connect` call on the same client has not finished yet.
    ConnectInProgress,
    /// The operation needs a live connection.
    NotConnected,
    /// The connection attempt did not complete in time.
    ConnectTimeout(SocketAddr, Duration),
    /// The connection attempt failed.
    Connect(SocketAddr, std::io::Error),
    /// `start` was called on a listening server.
    AlreadyListening,
    /// The operation needs a listening server.
    NotListening,
    /// The listening socket could not be created or bound.
    Bind(SocketAddr, std::io::Error),
    /// The payload contains the frame terminator byte.
    ReservedByte { position: usize },
    /// Writing a message to the socket failed.
    Write(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::AlreadyConnected => write!(f, "Client is already connected"),
            Error::ConnectInProgress => write!(f, "A connection attempt is already in flight"),
            Error::NotConnected => write!(f, "Not connected"),
            Error::ConnectTimeout(addr, timeout) => {
                write!(f, "Connecting to {} timed out after {:?}", addr, timeout)
            }
            Error::Connect(addr, e) => write!(f, "Failed to connect to {}: {}", addr, e),
            Error::AlreadyListening => write!(f, "Server is already listening"),
            Error::NotListening => write!(f, "Server is not listening"),
            Error::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            Error::ReservedByte { position } => write!(
                f,
                "Message contains the reserved terminator byte at offset {}",
                position
            ),
            Error::Write(e) => write!(f, "Failed to write message: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connect(_, e) | Error::Bind(_, e) | Error::Write(e) => Some(e),
            _ => None,
        }
    }
}
