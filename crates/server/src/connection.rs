//! A live, upgraded WebSocket connection

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::pool::BufferPool;
use crate::receiver::Messages;
use crate::sender::MessageSender;
use crate::socket::{FrameReader, FrameWriter};

/// Any async byte stream a connection can run over
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A boxed byte stream, as produced by accept and the decorator hook
pub type BoxedStream = Box<dyn ByteStream>;

/// State shared between the receive pipeline and every sender handle
pub(crate) struct ConnectionShared {
    pub(crate) writer: Mutex<FrameWriter<WriteHalf<BoxedStream>>>,

    /// Set once a Close frame has been sent or received
    pub(crate) closing: AtomicBool,
}

/// An accepted, upgraded connection
///
/// Obtain sender handles with [`Connection::sender`] before turning the
/// connection into its message stream with [`Connection::into_messages`].
pub struct Connection {
    reader: FrameReader<ReadHalf<BoxedStream>>,
    shared: Arc<ConnectionShared>,
    remote_addr: SocketAddr,
    keep_alive: Option<Duration>,
    pool: Arc<BufferPool>,
}

impl Connection {
    pub(crate) fn new(
        stream: BoxedStream,
        leftover: &[u8],
        remote_addr: SocketAddr,
        keep_alive: Option<Duration>,
        pool: Arc<BufferPool>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(read_half, leftover),
            shared: Arc::new(ConnectionShared {
                writer: Mutex::new(FrameWriter::new(write_half)),
                closing: AtomicBool::new(false),
            }),
            remote_addr,
            keep_alive,
            pool,
        }
    }

    /// Address of the remote peer
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// A cloneable handle for sending on this connection
    pub fn sender(&self) -> MessageSender {
        MessageSender::new(self.shared.clone())
    }

    /// Start the receive pipeline and return the stream of whole
    /// messages. The stream ends on remote close, local close, any
    /// underlying error, or when `cancel` fires.
    pub fn into_messages(self, cancel: CancellationToken) -> Messages {
        Messages::spawn(
            self.reader,
            self.shared,
            self.pool,
            self.keep_alive,
            cancel,
        )
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}
