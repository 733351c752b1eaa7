//! Socket ownership for one live connection.
//!
//! A [`Connection`] owns the write half of a TCP stream plus a duplicated
//! socket handle used for socket options and shutdown. The read half is
//! handed to the connection's read loop, which is the only reader.
//!
//! Closing is two-phase: [`Connection::request_close`] marks the connection
//! as closing and cancels its read loop; the read loop then runs teardown
//! and calls [`Connection::shutdown`], which releases anyone waiting in
//! [`Connection::closed`].

use crate::codec;
use crate::message::Message;
use crate::Error;
use socket2::{SockRef, Socket};
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Kernel buffer sizes, adjustable while connections are live.
#[derive(Debug)]
pub(crate) struct BufferSizes {
    receive: AtomicUsize,
    send: AtomicUsize,
}

impl BufferSizes {
    pub(crate) fn new(receive: usize, send: usize) -> Self {
        Self {
            receive: AtomicUsize::new(receive),
            send: AtomicUsize::new(send),
        }
    }

    pub(crate) fn receive(&self) -> usize {
        self.receive.load(Ordering::Relaxed)
    }

    pub(crate) fn send(&self) -> usize {
        self.send.load(Ordering::Relaxed)
    }

    pub(crate) fn set_receive(&self, size: usize) {
        self.receive.store(size, Ordering::Relaxed);
    }

    pub(crate) fn set_send(&self, size: usize) {
        self.send.store(size, Ordering::Relaxed);
    }

    /// Apply both sizes to a socket. Failures are logged, not fatal.
    pub(crate) fn apply(&self, socket: &Socket) {
        if let Err(e) = socket.set_recv_buffer_size(self.receive()) {
            warn!(error = %e, "Failed to set receive buffer size");
        }
        if let Err(e) = socket.set_send_buffer_size(self.send()) {
            warn!(error = %e, "Failed to set send buffer size");
        }
    }
}

/// A single live TCP connection.
#[derive(Debug)]
pub(crate) struct Connection {
    peer_addr: SocketAddr,
    /// Duplicate of the stream's socket for options and shutdown.
    socket: Socket,
    writer: Mutex<OwnedWriteHalf>,
    closing: AtomicBool,
    /// Stops the read loop.
    cancel: CancellationToken,
    /// Cancelled once teardown has finished.
    closed: CancellationToken,
}

impl Connection {
    /// Take ownership of `stream`, returning the read half for the read loop.
    pub(crate) fn new(
        stream: TcpStream,
        sizes: &BufferSizes,
        cancel: CancellationToken,
    ) -> io::Result<(Self, OwnedReadHalf)> {
        let peer_addr = stream.peer_addr()?;
        let socket = SockRef::from(&stream).try_clone()?;
        sizes.apply(&socket);

        let (reader, writer) = stream.into_split();
        let conn = Self {
            peer_addr,
            socket,
            writer: Mutex::new(writer),
            closing: AtomicBool::new(false),
            cancel,
            closed: CancellationToken::new(),
        };
        Ok((conn, reader))
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Frame and write a message.
    ///
    /// Writes are serialized so frames from concurrent senders never
    /// interleave.
    pub(crate) async fn send(&self, message: &Message) -> Result<(), Error> {
        if self.is_closing() {
            return Err(Error::NotConnected);
        }

        let frame = codec::encode(message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await.map_err(|e| {
            warn!(peer = %self.peer_addr, error = %e, "Failed to write message");
            Error::Write(e)
        })
    }

    /// Mark the connection as closing and stop its read loop.
    ///
    /// Returns `true` only for the first caller.
    pub(crate) fn request_close(&self) -> bool {
        let first = !self.closing.swap(true, Ordering::AcqRel);
        self.cancel.cancel();
        first
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Shut the socket down in both directions and release waiters.
    ///
    /// Safe to race with an in-flight read, which then sees end-of-stream.
    pub(crate) fn shutdown(&self) {
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            // The peer may already be gone.
            trace!(peer = %self.peer_addr, error = %e, "Socket shutdown failed");
        }
        self.closed.cancel();
    }

    /// Wait until teardown has finished.
    pub(crate) async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub(crate) fn apply_buffer_sizes(&self, sizes: &BufferSizes) {
        sizes.apply(&self.socket);
    }

    #[cfg(test)]
    pub(crate) fn receive_buffer_size(&self) -> io::Result<usize> {
        self.socket.recv_buffer_size()
    }
}
