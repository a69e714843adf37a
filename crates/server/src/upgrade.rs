//! Upgrade context handed to the application callback
//!
//! A single-use capability: exactly one of [`UpgradeContext::accept`] or
//! [`UpgradeContext::reject`] commits the response. Both consume the
//! context, so mutating a committed response or committing twice is
//! unrepresentable. A context dropped uncommitted performs an implicit
//! reject with the pre-set status.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::connection::{BoxedStream, Connection};
use crate::handshake::{write_accept_response, write_reject_response, Headers, RequestHead};
use crate::pool::BufferPool;

/// Status a response starts out with, and the implicit-reject default
pub const DEFAULT_REJECT_STATUS: u16 = 401;

/// Wraps an accepted byte stream before it is used further.
///
/// Composes TLS, compression, rate limiting and the like; runs
/// synchronously and may fail.
pub type StreamDecorator =
    Arc<dyn Fn(BoxedStream) -> std::io::Result<BoxedStream> + Send + Sync>;

#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("upgrade context is no longer usable")]
    InvalidState,

    #[error("stream decorator failed: {0}")]
    DecoratorFailed(std::io::Error),

    #[error("i/o error writing handshake response: {0}")]
    Io(#[from] std::io::Error),
}

/// The parsed upgrade request, read-only for the application
#[derive(Debug)]
pub struct UpgradeRequest {
    head: RequestHead,
    remote_addr: SocketAddr,
}

impl UpgradeRequest {
    /// The raw request head as received
    pub fn raw_head(&self) -> &str {
        self.head.raw()
    }

    /// The request line (`GET /path HTTP/1.1`)
    pub fn request_line(&self) -> &str {
        self.head.request_line()
    }

    pub fn headers(&self) -> &Headers {
        self.head.headers()
    }

    /// Shorthand for a case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers().get(name)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// The response under construction, mutable until committed
#[derive(Debug)]
pub struct UpgradeResponse {
    status: u16,
    headers: Vec<(String, String)>,
}

impl UpgradeResponse {
    fn new() -> Self {
        Self {
            status: DEFAULT_REJECT_STATUS,
            headers: Vec::new(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Status used by [`UpgradeContext::reject`] and the implicit reject
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Append an extra response header
    pub fn insert_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

/// One-shot capability for finishing (or refusing) an upgrade
pub struct UpgradeContext {
    request: UpgradeRequest,
    response: UpgradeResponse,
    key: String,
    stream: Option<BoxedStream>,
    /// Frame bytes a pipelining client sent along with the request head
    leftover: Vec<u8>,
    keep_alive: Option<Duration>,
    pool: Arc<BufferPool>,
}

impl UpgradeContext {
    pub(crate) fn new(
        head: RequestHead,
        key: String,
        remote_addr: SocketAddr,
        stream: BoxedStream,
        leftover: Vec<u8>,
        keep_alive: Option<Duration>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            request: UpgradeRequest { head, remote_addr },
            response: UpgradeResponse::new(),
            key,
            stream: Some(stream),
            leftover,
            keep_alive,
            pool,
        }
    }

    pub fn request(&self) -> &UpgradeRequest {
        &self.request
    }

    pub fn response(&self) -> &UpgradeResponse {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut UpgradeResponse {
        &mut self.response
    }

    /// Replace the underlying byte stream before accepting (TLS,
    /// compression and similar wrappers). On failure the context becomes
    /// terminal: the TCP connection is destroyed and any later commit
    /// returns [`UpgradeError::InvalidState`].
    pub fn decorate_stream<F>(&mut self, decorate: F) -> Result<(), UpgradeError>
    where
        F: FnOnce(BoxedStream) -> std::io::Result<BoxedStream>,
    {
        let stream = self.stream.take().ok_or(UpgradeError::InvalidState)?;
        match decorate(stream) {
            Ok(stream) => {
                self.stream = Some(stream);
                Ok(())
            }
            Err(err) => {
                warn!("Stream decorator failed: {}", err);
                Err(UpgradeError::DecoratorFailed(err))
            }
        }
    }

    /// Commit the response at `101 Switching Protocols`, write it, and
    /// wrap the stream into a live [`Connection`].
    ///
    /// Fails with [`UpgradeError::InvalidState`] if the context is
    /// terminal or the response status was changed to a non-101 value.
    pub async fn accept(mut self) -> Result<Connection, UpgradeError> {
        if self.response.status != DEFAULT_REJECT_STATUS && self.response.status != 101 {
            return Err(UpgradeError::InvalidState);
        }
        let mut stream = self.stream.take().ok_or(UpgradeError::InvalidState)?;

        self.response.set_status(101);
        write_accept_response(&mut stream, &self.pool, &self.key, &self.response.headers).await?;
        debug!("Connection upgraded for {}", self.request.remote_addr);

        Ok(Connection::new(
            stream,
            &self.leftover,
            self.request.remote_addr,
            self.keep_alive,
            self.pool.clone(),
        ))
    }

    /// Commit a non-101 response, write it and close the connection
    pub async fn reject(mut self, status: u16) -> Result<(), UpgradeError> {
        if status == 101 {
            return Err(UpgradeError::InvalidState);
        }
        let mut stream = self.stream.take().ok_or(UpgradeError::InvalidState)?;

        self.response.set_status(status);
        write_reject_response(&mut stream, &self.pool, status, &self.response.headers).await?;
        debug!("Upgrade rejected for {} with status {}", self.request.remote_addr, status);
        Ok(())
    }
}

impl Drop for UpgradeContext {
    fn drop(&mut self) {
        // Uncommitted context: implicit reject at the pre-set status.
        // Drop cannot await, so the farewell write runs on its own task.
        if let Some(mut stream) = self.stream.take() {
            let status = self.response.status;
            let headers = std::mem::take(&mut self.response.headers);
            let pool = self.pool.clone();
            debug!("Upgrade context dropped uncommitted; rejecting with status {}", status);
            tokio::spawn(async move {
                let _ = write_reject_response(&mut stream, &pool, status, &headers).await;
            });
        }
    }
}

impl std::fmt::Debug for UpgradeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeContext")
            .field("request", &self.request)
            .field("response", &self.response)
            .field("committed", &self.stream.is_none())
            .finish_non_exhaustive()
    }
}
