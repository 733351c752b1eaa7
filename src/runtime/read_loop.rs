//! The per-connection read loop.
//!
//! Reads chunks of at most the configured receive buffer size, feeds them to
//! a [`Framer`] and hands every completed message to the caller, in order.
//! The chunk never exceeds [`MAX_READ_CHUNK`], whatever the configured size.
//! The loop ends on end-of-stream, on a read error, or when its cancellation
//! token fires. A partial frame left over at that point is discarded.

use crate::codec::Framer;
use crate::message::Message;
use crate::runtime::BufferSizes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Upper bound on the bytes taken per read.
const MAX_READ_CHUNK: usize = 1 << 20;

/// Why a read loop stopped.
#[derive(Debug)]
pub(crate) enum Closed {
    /// The peer closed its side of the stream.
    Eof,
    /// Reading failed.
    Error(io::Error),
    /// Teardown was requested locally.
    Cancelled,
}

/// Read messages from `reader` until it closes or `cancel` fires.
pub(crate) async fn read_messages<R, F>(
    mut reader: R,
    sizes: &BufferSizes,
    cancel: &CancellationToken,
    mut on_message: F,
) -> Closed
where
    R: AsyncRead + Unpin,
    F: FnMut(Message),
{
    let mut chunk = vec![0u8; chunk_size(sizes)];
    let mut framer = Framer::with_capacity(chunk.len());

    let closed = loop {
        let size = chunk_size(sizes);
        if chunk.len() != size {
            chunk.resize(size, 0);
        }

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Closed::Cancelled,
            read = reader.read(&mut chunk) => read,
        };

        let n = match read {
            Ok(0) => break Closed::Eof,
            Ok(n) => n,
            Err(e) => break Closed::Error(e),
        };

        trace!(bytes = n, "Read chunk");
        framer.extend(&chunk[..n]);
        while let Some(message) = framer.next_message() {
            on_message(message);
        }
    };

    if framer.buffered() > 0 {
        trace!(bytes = framer.buffered(), "Discarding partial frame");
    }
    closed
}

fn chunk_size(sizes: &BufferSizes) -> usize {
    sizes.receive().clamp(1, MAX_READ_CHUNK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio_test::io::Builder;

    async fn collect<R: AsyncRead + Unpin>(
        reader: R,
        sizes: &BufferSizes,
    ) -> (Vec<Message>, Closed) {
        let mut messages = Vec::new();
        let closed =
            read_messages(reader, sizes, &CancellationToken::new(), |m| messages.push(m)).await;
        (messages, closed)
    }

    #[tokio::test]
    async fn test_message_split_across_reads() {
        let mock = Builder::new().read(b"pi").read(b"ng\x03po").read(b"ng\x03").build();
        let (messages, closed) = collect(mock, &BufferSizes::new(8192, 8192)).await;

        assert_eq!(messages, vec![Message::from_text("ping"), Message::from_text("pong")]);
        assert!(matches!(closed, Closed::Eof));
    }

    #[tokio::test]
    async fn test_one_byte_reads() {
        let mut builder = Builder::new();
        for b in b"hello\x03" {
            builder.read(std::slice::from_ref(b));
        }
        let (messages, _) = collect(builder.build(), &BufferSizes::new(8192, 8192)).await;

        assert_eq!(messages, vec![Message::from_text("hello")]);
    }

    #[tokio::test]
    async fn test_small_receive_buffer() {
        let mock = Builder::new().read(b"abcdef\x03gh\x03").build();
        let (messages, _) = collect(mock, &BufferSizes::new(3, 8192)).await;

        assert_eq!(messages, vec![Message::from_text("abcdef"), Message::from_text("gh")]);
    }

    #[tokio::test]
    async fn test_oversized_receive_buffer_is_capped() {
        let sizes = BufferSizes::new(usize::MAX, 8192);
        assert_eq!(chunk_size(&sizes), MAX_READ_CHUNK);

        let mock = Builder::new().read(b"big\x03").build();
        let (messages, closed) = collect(mock, &sizes).await;

        assert_eq!(messages, vec![Message::from_text("big")]);
        assert!(matches!(closed, Closed::Eof));
    }

    #[tokio::test]
    async fn test_many_messages_one_read_in_order() {
        let mock = Builder::new().read(b"A\x03B\x03").build();
        let (messages, _) = collect(mock, &BufferSizes::new(8192, 8192)).await;

        assert_eq!(messages, vec![Message::from_text("A"), Message::from_text("B")]);
    }

    #[tokio::test]
    async fn test_partial_frame_dropped_on_eof() {
        let mock = Builder::new().read(b"done\x03unfinished").build();
        let (messages, closed) = collect(mock, &BufferSizes::new(8192, 8192)).await;

        assert_eq!(messages, vec![Message::from_text("done")]);
        assert!(matches!(closed, Closed::Eof));
    }

    #[tokio::test]
    async fn test_read_error() {
        let mock = Builder::new()
            .read(b"ok\x03")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (messages, closed) = collect(mock, &BufferSizes::new(8192, 8192)).await;

        assert_eq!(messages, vec![Message::from_text("ok")]);
        assert!(matches!(closed, Closed::Error(e) if e.kind() == io::ErrorKind::ConnectionReset));
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_loop() {
        let (reader, mut writer) = tokio::io::duplex(64);
        let sizes = BufferSizes::new(8192, 8192);
        let cancel = CancellationToken::new();

        writer.write_all(b"first\x03").await.unwrap();

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut messages = Vec::new();
            let closed = read_messages(reader, &sizes, &token, |m| messages.push(m)).await;
            (messages, closed)
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let (messages, closed) = task.await.unwrap();
        assert_eq!(messages, vec![Message::from_text("first")]);
        assert!(matches!(closed, Closed::Cancelled));
        drop(writer);
    }
}
