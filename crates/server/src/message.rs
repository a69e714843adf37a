//! Whole messages as the application sees them

use std::ops::Deref;

use spindrift_protocol::MessageKind;

use crate::pool::{PooledBuf, PooledText};

/// A whole received message
///
/// Owns pooled storage; dropping the message returns the buffer to the
/// pool. Holding on to a message keeps exactly one buffer rented.
#[derive(Debug)]
pub enum Message {
    /// A UTF-8 text message
    Text(TextPayload),

    /// A binary message
    Binary(BinaryPayload),
}

impl Message {
    pub(crate) fn text(text: PooledText) -> Self {
        Message::Text(TextPayload(text))
    }

    pub(crate) fn binary(buf: PooledBuf, len: usize) -> Self {
        Message::Binary(BinaryPayload { buf, len })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Text(_) => MessageKind::Text,
            Message::Binary(_) => MessageKind::Binary,
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The text payload, if this is a text message
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
        }
    }

    /// The payload bytes (UTF-8 for text messages)
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data,
        }
    }
}

/// Decoded payload of a text message
#[derive(Debug)]
pub struct TextPayload(PooledText);

impl Deref for TextPayload {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

/// Payload of a binary message
#[derive(Debug)]
pub struct BinaryPayload {
    buf: PooledBuf,
    len: usize,
}

impl Deref for BinaryPayload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
