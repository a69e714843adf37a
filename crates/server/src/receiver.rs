//! Whole-message receive pipeline
//!
//! A single producer task drains the frame reader, reassembles fragments
//! into whole messages and queues them for the consumer. Per connection
//! the queue is FIFO, so messages are yielded in arrival order. The
//! sequence ends silently on remote close, local close or any underlying
//! error; only the consumer's cancellation token ends it early.

use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::io::ReadHalf;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use spindrift_protocol::MessageKind;

use crate::connection::{BoxedStream, ConnectionShared};
use crate::message::Message;
use crate::pool::{BufferPool, PooledBuf, DEFAULT_BUF_CAPACITY};
use crate::socket::{FrameReader, Incoming, SocketError};

/// Free buffer space guaranteed before every receive call
const MIN_FREE: usize = DEFAULT_BUF_CAPACITY;

/// Whole messages queued between the producer task and the consumer
const QUEUE_DEPTH: usize = 8;

/// The lazy sequence of whole messages on one connection
///
/// Implements [`futures::Stream`]; [`Messages::next`] is the pull
/// operation. No `Err` item exists: the stream simply ends.
pub struct Messages {
    rx: mpsc::Receiver<Message>,
}

impl Messages {
    pub(crate) fn spawn(
        reader: FrameReader<ReadHalf<BoxedStream>>,
        shared: Arc<ConnectionShared>,
        pool: Arc<BufferPool>,
        keep_alive: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(receive_loop(reader, shared, pool, keep_alive, cancel, tx));
        Messages { rx }
    }

    /// The next whole message, or `None` once the sequence has ended
    pub async fn next(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Stream for Messages {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for Messages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messages").finish_non_exhaustive()
    }
}

enum Step {
    Incoming(Result<Incoming, SocketError>),
    Idle,
    Cancelled,
}

async fn next_step(
    reader: &mut FrameReader<ReadHalf<BoxedStream>>,
    out: &mut [u8],
    cancel: &CancellationToken,
    keep_alive: Option<Duration>,
) -> Step {
    let receive = async {
        match keep_alive {
            Some(after) => match timeout(after, reader.receive(out)).await {
                Ok(result) => Step::Incoming(result),
                Err(_) => Step::Idle,
            },
            None => Step::Incoming(reader.receive(out).await),
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Step::Cancelled,
        step = receive => step,
    }
}

async fn receive_loop(
    mut reader: FrameReader<ReadHalf<BoxedStream>>,
    shared: Arc<ConnectionShared>,
    pool: Arc<BufferPool>,
    keep_alive: Option<Duration>,
    cancel: CancellationToken,
    tx: mpsc::Sender<Message>,
) {
    // Sizing heuristic: start each message at the largest size seen so
    // far to avoid re-growing on steady-state workloads.
    let mut max_seen = 0usize;
    let mut buf: Option<PooledBuf> = None;
    let mut used = 0usize;

    loop {
        if cancel.is_cancelled() || shared.closing.load(Ordering::Relaxed) {
            break;
        }

        let mut b = match buf.take() {
            Some(b) => b,
            None => pool.rent(max_seen),
        };
        if b.capacity() - used < MIN_FREE {
            b = pool.grow(b, used);
        }

        match next_step(&mut reader, &mut b[used..], &cancel, keep_alive).await {
            Step::Cancelled => break,

            Step::Idle => {
                buf = Some(b);
                let mut writer = shared.writer.lock().await;
                if writer.send_ping(b"").await.is_err() {
                    break;
                }
            }

            Step::Incoming(Err(err)) => {
                debug!("Receive ended: {}", err);
                break;
            }

            Step::Incoming(Ok(Incoming::Ping(payload))) => {
                buf = Some(b);
                let mut writer = shared.writer.lock().await;
                if writer.send_pong(&payload).await.is_err() {
                    break;
                }
            }

            Step::Incoming(Ok(Incoming::Close(frame))) => {
                // Echo the remote's code and reason, best effort
                if !shared.closing.swap(true, Ordering::Relaxed) {
                    let mut writer = shared.writer.lock().await;
                    let _ = writer.send_close(frame.as_ref()).await;
                    let _ = writer.shutdown().await;
                }
                break;
            }

            Step::Incoming(Ok(Incoming::Data {
                kind,
                len,
                end_of_message,
            })) => {
                used += len;
                max_seen = max_seen.max(used);

                if !end_of_message {
                    buf = Some(b);
                    continue;
                }

                trace!("Whole message: {:?}, {} bytes", kind, used);
                let message = match kind {
                    MessageKind::Binary => Message::binary(b, used),
                    MessageKind::Text => match std::str::from_utf8(&b[..used]) {
                        Ok(s) => {
                            let mut text = pool.rent_text(used);
                            text.push_str(s);
                            // The byte buffer goes back before the text
                            // buffer is handed on
                            drop(b);
                            Message::text(text)
                        }
                        Err(_) => {
                            debug!("Invalid UTF-8 in text message");
                            break;
                        }
                    },
                };
                used = 0;

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(message) => {
                        if sent.is_err() {
                            // Consumer dropped the stream
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use bytes::{BufMut, BytesMut};
    use spindrift_protocol::{apply_mask, CloseCode, CloseFrame, FrameHeader, OpCode};
    use tokio::io::AsyncWriteExt;

    fn client_frame(opcode: OpCode, fin: bool, payload: &[u8]) -> Vec<u8> {
        let key = [0xDE, 0xAD, 0xBE, 0xEF];
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

    fn connection_over(
        stream: tokio::io::DuplexStream,
        pool: &Arc<BufferPool>,
    ) -> Connection {
        Connection::new(
            Box::new(stream),
            &[],
            "127.0.0.1:0".parse().unwrap(),
            None,
            pool.clone(),
        )
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let pool = BufferPool::new();
        let (client, server) = tokio::io::duplex(1 << 16);
        let conn = connection_over(server, &pool);
        let mut messages = conn.into_messages(CancellationToken::new());

        let mut client = client;
        for i in 0..5u8 {
            let frame = client_frame(OpCode::Text, true, format!("msg-{}", i).as_bytes());
            client.write_all(&frame).await.unwrap();
        }

        for i in 0..5u8 {
            let msg = messages.next().await.unwrap();
            assert_eq!(msg.as_text(), Some(format!("msg-{}", i).as_str()));
        }
    }

    #[tokio::test]
    async fn test_fragments_reassemble_into_one_message() {
        let pool = BufferPool::new();
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let conn = connection_over(server, &pool);
        let mut messages = conn.into_messages(CancellationToken::new());

        client
            .write_all(&client_frame(OpCode::Binary, false, &[1, 2, 3]))
            .await
            .unwrap();
        client
            .write_all(&client_frame(OpCode::Continuation, false, &[4, 5]))
            .await
            .unwrap();
        client
            .write_all(&client_frame(OpCode::Continuation, true, &[6]))
            .await
            .unwrap();

        let msg = messages.next().await.unwrap();
        assert_eq!(msg.as_bytes(), &[1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_close_ends_sequence_silently() {
        let pool = BufferPool::new();
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let conn = connection_over(server, &pool);
        let mut messages = conn.into_messages(CancellationToken::new());

        client
            .write_all(&client_frame(OpCode::Text, true, b"last"))
            .await
            .unwrap();

        let close = CloseFrame::new(CloseCode::Normal, "bye");
        let mut payload = BytesMut::new();
        close.encode(&mut payload);
        client
            .write_all(&client_frame(OpCode::Close, true, &payload))
            .await
            .unwrap();

        assert_eq!(messages.next().await.unwrap().as_text(), Some("last"));
        assert!(messages.next().await.is_none());
    }

    #[tokio::test]
    async fn test_peer_disconnect_ends_sequence_silently() {
        let pool = BufferPool::new();
        let (client, server) = tokio::io::duplex(1 << 16);
        let conn = connection_over(server, &pool);
        let mut messages = conn.into_messages(CancellationToken::new());

        drop(client);
        assert!(messages.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_ends_sequence() {
        let pool = BufferPool::new();
        let (_client, server) = tokio::io::duplex(1 << 16);
        let conn = connection_over(server, &pool);

        let cancel = CancellationToken::new();
        let mut messages = conn.into_messages(cancel.clone());

        cancel.cancel();
        assert!(messages.next().await.is_none());
    }

    #[tokio::test]
    async fn test_buffers_drain_after_consumption() {
        let pool = BufferPool::new();
        let (mut client, server) = tokio::io::duplex(1 << 16);
        let conn = connection_over(server, &pool);
        let mut messages = conn.into_messages(CancellationToken::new());

        client
            .write_all(&client_frame(OpCode::Binary, true, &[0u8; 100]))
            .await
            .unwrap();

        let msg = messages.next().await.unwrap();
        assert_eq!(msg.len(), 100);
        drop(msg);
        drop(client);

        assert!(messages.next().await.is_none());
        assert_eq!(pool.in_flight(), 0);
    }
}
