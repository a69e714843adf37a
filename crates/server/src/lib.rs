//! Spindrift Server - lightweight async WebSocket server library
//!
//! Listens on a TCP endpoint, performs the RFC 6455 HTTP/1.1 upgrade
//! handshake and hands each accepted connection to an application
//! callback, which receives whole messages as a cancellable stream:
//!
//! - [`Server`]: configuration and start/stop lifecycle
//! - [`UpgradeContext`]: accept or reject one handshake
//! - [`Connection`]/[`Messages`]: the per-connection receive pipeline
//! - [`MessageSender`]: text/binary sends with oversize chunking
//! - [`BufferPool`]: pooled buffers backing the pipeline

mod connection;
mod handshake;
mod listener;
mod message;
mod pool;
mod receiver;
mod sender;
mod server;
mod socket;
mod upgrade;

pub use connection::{BoxedStream, ByteStream, Connection};
pub use handshake::{accept_key, reason_phrase, HandshakeError, Headers, RequestHead};
pub use message::{BinaryPayload, Message, TextPayload};
pub use pool::{BufferPool, PooledBuf, PooledText, DEFAULT_BUF_CAPACITY};
pub use receiver::Messages;
pub use sender::{MessageSender, SendError};
pub use server::{Server, ServerConfig, ServerError};
pub use upgrade::{
    StreamDecorator, UpgradeContext, UpgradeError, UpgradeRequest, UpgradeResponse,
    DEFAULT_REJECT_STATUS,
};

pub use spindrift_protocol::{CloseCode, CloseFrame, MessageKind};

// The consumer-facing cancellation handle, re-exported so applications
// do not need a direct tokio-util dependency.
pub use tokio_util::sync::CancellationToken;
