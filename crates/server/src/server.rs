//! Server façade: configuration and lifecycle

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::listener::{accept_loop, BoxError, Handler, ListenerSettings};
use crate::pool::BufferPool;
use crate::upgrade::{StreamDecorator, UpgradeContext};

/// Default ping cadence on idle connections
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Listen address
    pub bind_ip: IpAddr,

    /// Listen port; 0 selects an ephemeral port
    pub bind_port: u16,

    /// Ping cadence on idle connections; `None` disables keep-alive
    pub keep_alive_interval: Option<Duration>,

    /// Wraps each accepted byte stream before handshake parsing
    pub stream_decorator: Option<StreamDecorator>,
}

impl ServerConfig {
    pub fn new(bind_port: u16) -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port,
            keep_alive_interval: Some(DEFAULT_KEEP_ALIVE),
            stream_decorator: None,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_ip", &self.bind_ip)
            .field("bind_port", &self.bind_port)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .finish_non_exhaustive()
    }
}

enum State {
    Idle,
    Listening {
        cancel: CancellationToken,
        task: JoinHandle<()>,
    },
}

/// The WebSocket server
///
/// `start` binds and spawns the accept loop; the supplied handler runs
/// once per successful handshake. `start` and `stop` are idempotent and
/// may be called from any task.
pub struct Server {
    config: ServerConfig,
    pool: Arc<BufferPool>,
    state: Mutex<State>,
    active: AtomicBool,
    bound_port: AtomicU16,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            pool: BufferPool::global(),
            state: Mutex::new(State::Idle),
            active: AtomicBool::new(false),
            bound_port: AtomicU16::new(0),
        }
    }

    /// Bind the listener and start accepting connections.
    ///
    /// A second call while listening is a no-op. Handler errors are
    /// logged and swallowed; the connection is closed afterwards.
    pub async fn start<F, Fut, E>(&self, handler: F) -> Result<(), ServerError>
    where
        F: Fn(UpgradeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let mut state = self.state.lock().await;
        if matches!(*state, State::Listening { .. }) {
            debug!("Start ignored; server already listening");
            return Ok(());
        }

        let addr = SocketAddr::new(self.config.bind_ip, self.config.bind_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::BindFailed { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::BindFailed { addr, source })?;

        let handler: Handler = Arc::new(move |context| {
            let fut = handler(context);
            let boxed: futures::future::BoxFuture<'static, Result<(), BoxError>> =
                Box::pin(async move { fut.await.map_err(Into::into) });
            boxed
        });
        let settings = Arc::new(ListenerSettings {
            handler,
            decorator: self.config.stream_decorator.clone(),
            keep_alive: self.config.keep_alive_interval,
            pool: self.pool.clone(),
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, cancel.clone(), settings));

        info!("WebSocket server listening on {}", local_addr);
        self.bound_port.store(local_addr.port(), Ordering::Relaxed);
        self.active.store(true, Ordering::Relaxed);
        *state = State::Listening { cancel, task };
        Ok(())
    }

    /// Cancel the accept loop and close the listener. Idempotent.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let State::Listening { cancel, task } =
            std::mem::replace(&mut *state, State::Idle)
        {
            cancel.cancel();
            self.active.store(false, Ordering::Relaxed);
            let _ = task.await;
            info!("Server stopped");
        }
    }

    /// Whether the accept loop is running
    pub fn active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Configured listen address
    pub fn host_ip(&self) -> IpAddr {
        self.config.bind_ip
    }

    /// The bound port while active, otherwise the configured port
    pub fn host_port(&self) -> u16 {
        match self.bound_port.load(Ordering::Relaxed) {
            0 => self.config.bind_port,
            port => port,
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}
