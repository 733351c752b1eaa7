//! Connection runtime shared by the client and the server.
//!
//! - `Connection`: socket ownership, framed writes, close handshake
//! - `BufferSizes`: live-adjustable kernel buffer sizes
//! - `read_messages`: the read loop driving the framer

mod connection;
mod read_loop;

pub(crate) use connection::{BufferSizes, Connection};
pub(crate) use read_loop::{read_messages, Closed};
