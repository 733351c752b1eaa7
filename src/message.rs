//! Application messages exchanged between clients and servers.
//!
//! A message is an immutable byte sequence. It can optionally be split into
//! text parts separated by [`SEPARATOR`]. Text is mapped one byte per
//! character in both directions (Latin-1), never UTF-8 encoded.

use bytes::Bytes;
use std::fmt;

/// Byte terminating every message on the wire.
pub const TERMINATOR: u8 = 0x03;

/// Byte joining the parts of a multi-part message.
pub const SEPARATOR: u8 = 0xFF;

/// Byte that [`Message::segments`] also treats as a separator.
pub const NULL: u8 = 0x00;

/// An immutable message payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Message {
    bytes: Bytes,
}

impl Message {
    /// Create a message from raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Create a message from text, one byte per character.
    ///
    /// Characters above U+00FF are truncated to their low byte.
    pub fn from_text(text: &str) -> Self {
        Self::new(text.chars().map(|c| c as u8).collect::<Vec<u8>>())
    }

    /// Create a message from text parts joined by [`SEPARATOR`].
    pub fn from_parts<S: AsRef<str>>(parts: &[S]) -> Self {
        let mut bytes = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                bytes.push(SEPARATOR);
            }
            bytes.extend(part.as_ref().chars().map(|c| c as u8));
        }
        Self::new(bytes)
    }

    /// Raw payload bytes (without terminator).
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Consume the message, returning its payload.
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The whole payload as text, followed by its [`segments`](Self::segments).
    ///
    /// Element 0 is always present, even for an empty message.
    pub fn parts(&self) -> Vec<String> {
        let mut parts = vec![self.to_string()];
        parts.extend(self.segments());
        parts
    }

    /// Split the payload into text segments.
    ///
    /// Both [`SEPARATOR`] and [`NULL`] end a segment. Empty segments between
    /// two separators are kept; a trailing empty segment is not. This is a
    /// best-effort split and does not invert [`Message::from_parts`] for
    /// arbitrary binary payloads.
    pub fn segments(&self) -> Vec<String> {
        let mut segments = Vec::new();
        let mut current = String::new();

        for &b in self.bytes.iter() {
            if b == SEPARATOR || b == NULL {
                segments.push(std::mem::take(&mut current));
            } else {
                current.push(b as char);
            }
        }

        if !current.is_empty() {
            segments.push(current);
        }

        segments
    }

    /// Position of the first [`TERMINATOR`] byte in the payload, if any.
    pub fn terminator_position(&self) -> Option<usize> {
        self.bytes.iter().position(|&b| b == TERMINATOR)
    }
}

impl From<Bytes> for Message {
    fn from(bytes: Bytes) -> Self {
        Self::new(bytes)
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for Message {
    fn from(bytes: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(bytes))
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::from_text(text)
    }
}

impl AsRef<[u8]> for Message {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.bytes.iter() {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}
