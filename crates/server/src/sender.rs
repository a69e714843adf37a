//! Outbound message helpers
//!
//! The underlying socket rents a send buffer sized to each frame, so
//! oversized messages are split into bounded chunks: peak buffer usage
//! stays flat and the first byte leaves sooner.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use spindrift_protocol::{CloseCode, CloseFrame, MessageKind};

use crate::connection::ConnectionShared;

/// Largest payload carried in a single frame
pub(crate) const MAX_FRAME_PAYLOAD: usize = 65536;

/// Chunk size for oversized messages, leaving frame header headroom
pub(crate) const SEND_CHUNK: usize = MAX_FRAME_PAYLOAD - 14;

#[derive(Error, Debug)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A cloneable handle for sending messages on one connection
///
/// All handles share the connection's frame writer; a whole message is
/// written under the writer lock, so fragments of concurrent sends never
/// interleave.
#[derive(Clone)]
pub struct MessageSender {
    shared: Arc<ConnectionShared>,
}

impl MessageSender {
    pub(crate) fn new(shared: Arc<ConnectionShared>) -> Self {
        Self { shared }
    }

    /// Send a binary message
    pub async fn send_binary(&self, data: &[u8]) -> Result<(), SendError> {
        self.send(data, MessageKind::Binary).await
    }

    /// Send a text message
    pub async fn send_text(&self, text: &str) -> Result<(), SendError> {
        self.send(text.as_bytes(), MessageKind::Text).await
    }

    async fn send(&self, data: &[u8], kind: MessageKind) -> Result<(), SendError> {
        if self.shared.closing.load(Ordering::Relaxed) {
            return Err(SendError::Closed);
        }

        let mut writer = self.shared.writer.lock().await;

        if data.len() <= MAX_FRAME_PAYLOAD {
            writer.send(data, kind, true).await?;
            return Ok(());
        }

        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + SEND_CHUNK).min(data.len());
            writer.send(&data[offset..end], kind, end == data.len()).await?;
            offset = end;
        }
        Ok(())
    }

    /// Send a Close frame and mark the connection closing.
    ///
    /// The receive pipeline ends on its next iteration; further sends
    /// fail with [`SendError::Closed`].
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), SendError> {
        if self.shared.closing.swap(true, Ordering::Relaxed) {
            return Err(SendError::Closed);
        }

        debug!("Closing connection with code {}", u16::from(code));
        let frame = CloseFrame::new(code, reason);
        let mut writer = self.shared.writer.lock().await;
        writer.send_close(Some(&frame)).await?;
        Ok(())
    }
}

impl std::fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender").finish_non_exhaustive()
    }
}
