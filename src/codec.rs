//! Wire framing for messages.
//!
//! Each message is sent as its payload followed by a single [`TERMINATOR`]
//! byte. There is no length prefix, so the receiving side has to reassemble
//! frames from whatever chunks the stream hands out:
//!
//! ```text
//! read 1: "pi"            -> nothing yet, "pi" retained
//! read 2: "ng\x03po"      -> "ping", "po" retained
//! read 3: "ng\x03a\x03"   -> "pong", "a"
//! ```
//!
//! Payloads must not contain the terminator. [`encode`] rejects them instead
//! of putting a truncated frame on the wire.

use crate::message::{Message, TERMINATOR};
use crate::Error;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encode a message into its wire representation.
pub fn encode(message: &Message) -> Result<Bytes, Error> {
    if let Some(position) = message.terminator_position() {
        return Err(Error::ReservedByte { position });
    }

    let mut frame = BytesMut::with_capacity(message.len() + 1);
    frame.extend_from_slice(message.bytes());
    frame.put_u8(TERMINATOR);
    Ok(frame.freeze())
}

/// Incremental decoder turning stream chunks into messages.
#[derive(Debug, Default)]
pub struct Framer {
    buffer: BytesMut,
    /// Prefix of `buffer` already known not to contain a terminator.
    scanned: usize,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            scanned: 0,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete message, if the buffer holds one.
    ///
    /// Call repeatedly after each [`extend`](Self::extend): one chunk can
    /// complete any number of messages.
    pub fn next_message(&mut self) -> Option<Message> {
        match self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == TERMINATOR)
        {
            Some(offset) => {
                let payload = self.buffer.split_to(self.scanned + offset).freeze();
                self.buffer.advance(1);
                self.scanned = 0;
                Some(Message::from(payload))
            }
            None => {
                self.scanned = self.buffer.len();
                None
            }
        }
    }

    /// Bytes of the partial frame held back for the next read.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(framer: &mut Framer) -> Vec<Message> {
        std::iter::from_fn(|| framer.next_message()).collect()
    }

    #[test]
    fn test_encode_appends_terminator() {
        let frame = encode(&Message::from_text("ping")).unwrap();
        assert_eq!(frame.as_ref(), b"ping\x03");

        let frame = encode(&Message::default()).unwrap();
        assert_eq!(frame.as_ref(), b"\x03");
    }

    #[test]
    fn test_encode_rejects_terminator() {
        let result = encode(&Message::new(&b"ab\x03"[..]));
        assert!(matches!(result, Err(Error::ReservedByte { position: 2 })));
    }

    #[test]
    fn test_single_read() {
        let mut framer = Framer::new();
        framer.extend(b"hello\x03");
        assert_eq!(drain(&mut framer), vec![Message::from_text("hello")]);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_byte_at_a_time() {
        let payload = b"split across many reads";
        let frame = encode(&Message::from(&payload[..])).unwrap();

        let mut framer = Framer::new();
        let mut received = Vec::new();
        for b in frame.iter() {
            framer.extend(&[*b]);
            received.extend(drain(&mut framer));
        }

        assert_eq!(received, vec![Message::from(&payload[..])]);
    }

    #[test]
    fn test_many_messages_in_one_read() {
        let mut framer = Framer::new();
        framer.extend(b"A\x03B\x03C");

        assert_eq!(
            drain(&mut framer),
            vec![Message::from_text("A"), Message::from_text("B")]
        );
        assert_eq!(framer.buffered(), 1);

        framer.extend(b"\x03");
        assert_eq!(drain(&mut framer), vec![Message::from_text("C")]);
    }

    #[test]
    fn test_terminator_mid_chunk() {
        let mut framer = Framer::new();
        framer.extend(b"pi");
        assert!(framer.next_message().is_none());
        framer.extend(b"ng\x03po");
        assert_eq!(framer.next_message(), Some(Message::from_text("ping")));
        assert!(framer.next_message().is_none());
        framer.extend(b"ng\x03");
        assert_eq!(framer.next_message(), Some(Message::from_text("pong")));
    }

    #[test]
    fn test_empty_frames() {
        let mut framer = Framer::new();
        framer.extend(b"\x03\x03");
        assert_eq!(drain(&mut framer), vec![Message::default(), Message::default()]);
    }

    #[test]
    fn test_multi_part_payload_survives_framing() {
        let msg = Message::from_parts(&["x", "y", "z"]);
        let mut framer = Framer::new();
        framer.extend(&encode(&msg).unwrap());
        assert_eq!(framer.next_message().unwrap().segments(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_clear_drops_partial() {
        let mut framer = Framer::with_capacity(16);
        framer.extend(b"partial");
        assert!(framer.next_message().is_none());
        framer.clear();
        framer.extend(b"\x03");
        assert_eq!(framer.next_message(), Some(Message::default()));
    }
}
