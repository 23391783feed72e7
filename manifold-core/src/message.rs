//! Message buffers.
//!
//! A [`Message`] is an owned byte buffer split into a protocol header and an
//! application body. Messages are moved, never shared: queues, AIOs and
//! pipes take them by value, so at any time exactly one party owns each one.
//! Protocols that fan a message out to several peers call [`Message::dup`]
//! explicitly.

use crate::pipe::PipeId;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// An owned message.
#[derive(Default)]
pub struct Message {
    header: BytesMut,
    body: BytesMut,
    pipe: Option<PipeId>,
}

impl Message {
    /// Create an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zero-filled message with a body of `size` bytes.
    #[must_use]
    pub fn zeroed(size: usize) -> Self {
        let mut body = BytesMut::with_capacity(size);
        body.resize(size, 0);
        Self {
            body,
            ..Self::default()
        }
    }

    /// Create an empty message with room for `capacity` body bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            body: BytesMut::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Body length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Check if the body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Header plus body length, as framed on a stream transport.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut BytesMut {
        &mut self.body
    }

    #[must_use]
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut BytesMut {
        &mut self.header
    }

    /// Append bytes to the body.
    pub fn append(&mut self, data: &[u8]) {
        self.body.put_slice(data);
    }

    /// Append a big-endian u32 to the header.
    pub fn header_append_u32(&mut self, value: u32) {
        self.header.put_u32(value);
    }

    /// Drop all header and body bytes.
    pub fn clear(&mut self) {
        self.header.clear();
        self.body.clear();
    }

    /// Pipe this message arrived on, if any.
    #[must_use]
    pub const fn pipe(&self) -> Option<PipeId> {
        self.pipe
    }

    pub fn set_pipe(&mut self, pipe: PipeId) {
        self.pipe = Some(pipe);
    }

    /// Explicitly duplicate the message (header, body and source pipe).
    #[must_use]
    pub fn dup(&self) -> Self {
        Self {
            header: self.header.clone(),
            body: self.body.clone(),
            pipe: self.pipe,
        }
    }

    /// Consume the message and return the body.
    #[must_use]
    pub fn into_body(self) -> Bytes {
        self.body.freeze()
    }

    /// Split into header and body for framing.
    #[must_use]
    pub fn into_parts(self) -> (BytesMut, BytesMut) {
        (self.header, self.body)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("header_len", &self.header.len())
            .field("body_len", &self.body.len())
            .field("pipe", &self.pipe)
            .finish()
    }
}

impl From<&[u8]> for Message {
    fn from(data: &[u8]) -> Self {
        Self {
            body: BytesMut::from(data),
            ..Self::default()
        }
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Self::from(s.as_bytes())
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self::from(&data[..])
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Self::from(&data[..])
    }
}

impl From<BytesMut> for Message {
    fn from(body: BytesMut) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_message() {
        let msg = Message::zeroed(64);
        assert_eq!(msg.len(), 64);
        assert!(msg.body().iter().all(|b| *b == 0));
        assert!(msg.header().is_empty());
    }

    #[test]
    fn test_append_and_header() {
        let mut msg = Message::from("hello");
        msg.append(b", world");
        msg.header_append_u32(0x8000_0001);
        assert_eq!(msg.body(), b"hello, world");
        assert_eq!(msg.header(), &[0x80, 0, 0, 1]);
        assert_eq!(msg.wire_len(), 16);
    }

    #[test]
    fn test_dup_is_independent() {
        let mut original = Message::from("abc");
        let copy = original.dup();
        original.append(b"d");
        assert_eq!(copy.body(), b"abc");
        assert_eq!(original.body(), b"abcd");
    }

    #[test]
    fn test_clear() {
        let mut msg = Message::from("payload");
        msg.header_append_u32(7);
        msg.clear();
        assert!(msg.is_empty());
        assert_eq!(msg.wire_len(), 0);
    }
}
