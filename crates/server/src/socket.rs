//! Frame-level stream adapter
//!
//! Drives a raw byte stream through the `spindrift-protocol` codec. The
//! reader fills caller buffers with data payload bytes (a frame larger
//! than the free space is surfaced over several calls) and raises Ping
//! and Close as events; the writer frames outgoing payloads, tracking
//! continuation opcodes across fragments of one message.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use spindrift_protocol::{
    apply_mask, CloseFrame, FrameHeader, MessageKind, OpCode, ProtocolError,
};

/// Something the frame reader produced
#[derive(Debug)]
pub(crate) enum Incoming {
    /// Data payload bytes landed in the caller's buffer
    Data {
        kind: MessageKind,
        len: usize,
        end_of_message: bool,
    },

    /// A Ping arrived; its payload must be echoed in a Pong
    Ping(Bytes),

    /// A Close arrived
    Close(Option<CloseFrame>),
}

#[derive(Error, Debug)]
pub(crate) enum SocketError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection closed mid-frame")]
    UnexpectedEof,
}

/// Payload of the data frame currently being drained
struct DataFrame {
    kind: MessageKind,
    remaining: u64,
    fin: bool,
    mask: Option<[u8; 4]>,
    mask_offset: usize,
}

/// Decodes inbound frames from a byte stream
///
/// All state lives in the struct, never in a pending future, so a
/// `receive` future can be dropped (timeout, cancellation) and a later
/// call resumes exactly where the stream left off.
pub(crate) struct FrameReader<R> {
    stream: R,
    buf: BytesMut,
    frame: Option<DataFrame>,
    message_kind: Option<MessageKind>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// `leftover` holds frame bytes that arrived together with the
    /// handshake head and must be decoded first.
    pub(crate) fn new(stream: R, leftover: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        buf.extend_from_slice(leftover);
        Self {
            stream,
            buf,
            frame: None,
            message_kind: None,
        }
    }

    /// Receive the next event, copying data payload bytes into `out`.
    ///
    /// `len` never exceeds `out.len()`; `end_of_message` is true only
    /// once the final bytes of a `fin` frame have been delivered.
    pub(crate) async fn receive(&mut self, out: &mut [u8]) -> Result<Incoming, SocketError> {
        loop {
            if self.frame.is_some() {
                return self.drain_payload(out).await;
            }

            let header = self.read_header().await?;
            trace!(
                opcode = ?header.opcode,
                len = header.payload_len,
                fin = header.fin,
                "frame header"
            );

            if header.opcode.is_control() {
                let payload = self.read_control_payload(&header).await?;
                match header.opcode {
                    OpCode::Ping => return Ok(Incoming::Ping(payload)),
                    OpCode::Pong => continue,
                    _ => return Ok(Incoming::Close(CloseFrame::decode(&payload)?)),
                }
            }

            // Client-to-server data frames must be masked
            if header.mask.is_none() {
                return Err(ProtocolError::UnmaskedFrame.into());
            }

            let kind = match MessageKind::from_opcode(header.opcode) {
                Some(kind) => {
                    if self.message_kind.is_some() {
                        return Err(ProtocolError::InterleavedDataFrame.into());
                    }
                    kind
                }
                None => self
                    .message_kind
                    .ok_or(ProtocolError::UnexpectedContinuation)?,
            };

            if header.payload_len == 0 {
                if header.fin {
                    self.message_kind = None;
                    return Ok(Incoming::Data {
                        kind,
                        len: 0,
                        end_of_message: true,
                    });
                }
                self.message_kind = Some(kind);
                return Ok(Incoming::Data {
                    kind,
                    len: 0,
                    end_of_message: false,
                });
            }

            self.message_kind = Some(kind);
            self.frame = Some(DataFrame {
                kind,
                remaining: header.payload_len,
                fin: header.fin,
                mask: header.mask,
                mask_offset: 0,
            });
        }
    }

    async fn drain_payload(&mut self, out: &mut [u8]) -> Result<Incoming, SocketError> {
        if self.buf.is_empty() {
            self.read_more().await?;
        }

        let Some(frame) = self.frame.as_mut() else {
            return Err(SocketError::UnexpectedEof);
        };

        let want = u64::min(frame.remaining, out.len() as u64) as usize;
        let take = want.min(self.buf.len());
        out[..take].copy_from_slice(&self.buf[..take]);
        self.buf.advance(take);

        if let Some(key) = frame.mask {
            apply_mask(&mut out[..take], key, frame.mask_offset);
        }
        frame.mask_offset += take;
        frame.remaining -= take as u64;

        let kind = frame.kind;
        let end_of_message = frame.fin && frame.remaining == 0;
        if frame.remaining == 0 {
            if frame.fin {
                self.message_kind = None;
            }
            self.frame = None;
        }

        Ok(Incoming::Data {
            kind,
            len: take,
            end_of_message,
        })
    }

    async fn read_header(&mut self) -> Result<FrameHeader, SocketError> {
        loop {
            if let Some((header, len)) = FrameHeader::decode(&self.buf)? {
                self.buf.advance(len);
                return Ok(header);
            }
            self.read_more().await?;
        }
    }

    async fn read_control_payload(&mut self, header: &FrameHeader) -> Result<Bytes, SocketError> {
        let len = header.payload_len as usize;
        while self.buf.len() < len {
            self.read_more().await?;
        }

        let mut payload = self.buf.split_to(len);
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key, 0);
        }
        Ok(payload.freeze())
    }

    async fn read_more(&mut self) -> Result<(), SocketError> {
        let n = self.stream.read_buf(&mut self.buf).await?;
        if n == 0 {
            return Err(SocketError::UnexpectedEof);
        }
        Ok(())
    }
}

/// Encodes outbound frames onto a byte stream
///
/// Server-to-client frames are never masked (RFC 6455 section 5.1).
pub(crate) struct FrameWriter<W> {
    stream: W,
    scratch: BytesMut,
    continuing: bool,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: W) -> Self {
        Self {
            stream,
            scratch: BytesMut::with_capacity(16),
            continuing: false,
        }
    }

    /// Send one data frame; continuation opcodes are tracked across the
    /// fragments of a message.
    pub(crate) async fn send(
        &mut self,
        payload: &[u8],
        kind: MessageKind,
        end_of_message: bool,
    ) -> std::io::Result<()> {
        let opcode = if self.continuing {
            OpCode::Continuation
        } else {
            kind.opcode()
        };

        self.write_frame(opcode, end_of_message, payload).await?;
        self.continuing = !end_of_message;
        Ok(())
    }

    pub(crate) async fn send_ping(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.write_frame(OpCode::Ping, true, payload).await
    }

    pub(crate) async fn send_pong(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.write_frame(OpCode::Pong, true, payload).await
    }

    pub(crate) async fn send_close(&mut self, frame: Option<&CloseFrame>) -> std::io::Result<()> {
        let mut payload = BytesMut::new();
        if let Some(frame) = frame {
            frame.encode(&mut payload);
        }
        self.write_frame(OpCode::Close, true, &payload).await
    }

    async fn write_frame(
        &mut self,
        opcode: OpCode,
        fin: bool,
        payload: &[u8],
    ) -> std::io::Result<()> {
        let header = FrameHeader {
            fin,
            opcode,
            mask: None,
            payload_len: payload.len() as u64,
        };

        self.scratch.clear();
        header.encode(&mut self.scratch);
        self.stream.write_all(&self.scratch).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await
    }

    pub(crate) async fn shutdown(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn client_frame(opcode: OpCode, fin: bool, payload: &[u8]) -> Vec<u8> {
        let key = [0x11, 0x22, 0x33, 0x44];
        let header = FrameHeader {
            fin,
            opcode,
            mask: Some(key),
            payload_len: payload.len() as u64,
        };
        let mut frame = BytesMut::new();
        header.encode(&mut frame);
        let mut masked = payload.to_vec();
        apply_mask(&mut masked, key, 0);
        frame.put_slice(&masked);
        frame.to_vec()
    }

    fn reader_over(bytes: Vec<u8>) -> FrameReader<std::io::Cursor<Vec<u8>>> {
        FrameReader::new(std::io::Cursor::new(bytes), &[])
    }

    #[tokio::test]
    async fn test_receive_single_text_frame() {
        let mut reader = reader_over(client_frame(OpCode::Text, true, b"ping"));
        let mut out = [0u8; 64];

        let incoming = reader.receive(&mut out).await.unwrap();
        match incoming {
            Incoming::Data {
                kind,
                len,
                end_of_message,
            } => {
                assert_eq!(kind, MessageKind::Text);
                assert_eq!(len, 4);
                assert!(end_of_message);
                assert_eq!(&out[..4], b"ping");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_large_frame_spans_receives() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let mut reader = reader_over(client_frame(OpCode::Binary, true, &payload));

        let mut out = [0u8; 1024];
        let mut collected = Vec::new();
        loop {
            match reader.receive(&mut out).await.unwrap() {
                Incoming::Data {
                    len,
                    end_of_message,
                    kind,
                } => {
                    assert_eq!(kind, MessageKind::Binary);
                    collected.extend_from_slice(&out[..len]);
                    if end_of_message {
                        break;
                    }
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(collected, payload);
    }

    #[tokio::test]
    async fn test_fragmented_message_keeps_kind() {
        let mut bytes = client_frame(OpCode::Text, false, b"he");
        bytes.extend(client_frame(OpCode::Continuation, false, b"ll"));
        bytes.extend(client_frame(OpCode::Continuation, true, b"o"));
        let mut reader = reader_over(bytes);

        let mut out = [0u8; 64];
        let mut text = Vec::new();
        loop {
            match reader.receive(&mut out).await.unwrap() {
                Incoming::Data {
                    kind,
                    len,
                    end_of_message,
                } => {
                    assert_eq!(kind, MessageKind::Text);
                    text.extend_from_slice(&out[..len]);
                    if end_of_message {
                        break;
                    }
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(text, b"hello");
    }

    #[tokio::test]
    async fn test_ping_between_fragments() {
        let mut bytes = client_frame(OpCode::Text, false, b"a");
        bytes.extend(client_frame(OpCode::Ping, true, b"probe"));
        bytes.extend(client_frame(OpCode::Continuation, true, b"b"));
        let mut reader = reader_over(bytes);

        let mut out = [0u8; 64];
        let first = reader.receive(&mut out).await.unwrap();
        assert!(matches!(first, Incoming::Data { len: 1, .. }));

        let ping = reader.receive(&mut out).await.unwrap();
        match ping {
            Incoming::Ping(payload) => assert_eq!(&payload[..], b"probe"),
            other => panic!("unexpected: {:?}", other),
        }

        let rest = reader.receive(&mut out).await.unwrap();
        assert!(matches!(
            rest,
            Incoming::Data {
                len: 1,
                end_of_message: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_pong_is_discarded() {
        let mut bytes = client_frame(OpCode::Pong, true, b"late");
        bytes.extend(client_frame(OpCode::Binary, true, &[7]));
        let mut reader = reader_over(bytes);

        let mut out = [0u8; 16];
        let incoming = reader.receive(&mut out).await.unwrap();
        assert!(matches!(
            incoming,
            Incoming::Data {
                kind: MessageKind::Binary,
                len: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_close_carries_code_and_reason() {
        let close = CloseFrame::new(spindrift_protocol::CloseCode::Normal, "bye");
        let mut payload = BytesMut::new();
        close.encode(&mut payload);
        let mut reader = reader_over(client_frame(OpCode::Close, true, &payload));

        let mut out = [0u8; 16];
        match reader.receive(&mut out).await.unwrap() {
            Incoming::Close(Some(frame)) => assert_eq!(frame, close),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unmasked_client_frame_rejected() {
        let header = FrameHeader {
            fin: true,
            opcode: OpCode::Text,
            mask: None,
            payload_len: 2,
        };
        let mut bytes = BytesMut::new();
        header.encode(&mut bytes);
        bytes.put_slice(b"hi");
        let mut reader = reader_over(bytes.to_vec());

        let mut out = [0u8; 16];
        let err = reader.receive(&mut out).await.unwrap_err();
        assert!(matches!(
            err,
            SocketError::Protocol(ProtocolError::UnmaskedFrame)
        ));
    }

    #[tokio::test]
    async fn test_bare_continuation_rejected() {
        let mut reader = reader_over(client_frame(OpCode::Continuation, true, b"x"));
        let mut out = [0u8; 16];
        let err = reader.receive(&mut out).await.unwrap_err();
        assert!(matches!(
            err,
            SocketError::Protocol(ProtocolError::UnexpectedContinuation)
        ));
    }

    #[tokio::test]
    async fn test_writer_tracks_continuation_opcodes() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.send(b"ab", MessageKind::Binary, false).await.unwrap();
        writer.send(b"cd", MessageKind::Binary, false).await.unwrap();
        writer.send(b"ef", MessageKind::Binary, true).await.unwrap();

        let wire = writer.stream;
        let (first, len) = FrameHeader::decode(&wire).unwrap().unwrap();
        assert_eq!(first.opcode, OpCode::Binary);
        assert!(!first.fin);

        let second_at = len + 2;
        let (second, _) = FrameHeader::decode(&wire[second_at..]).unwrap().unwrap();
        assert_eq!(second.opcode, OpCode::Continuation);
        assert!(!second.fin);

        let third_at = second_at + 4;
        let (third, _) = FrameHeader::decode(&wire[third_at..]).unwrap().unwrap();
        assert_eq!(third.opcode, OpCode::Continuation);
        assert!(third.fin);
    }

    #[tokio::test]
    async fn test_writer_frames_are_unmasked() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.send(b"pong", MessageKind::Text, true).await.unwrap();

        let wire = writer.stream;
        let (header, len) = FrameHeader::decode(&wire).unwrap().unwrap();
        assert_eq!(header.opcode, OpCode::Text);
        assert_eq!(header.mask, None);
        assert!(header.fin);
        assert_eq!(&wire[len..], b"pong");
    }
}
