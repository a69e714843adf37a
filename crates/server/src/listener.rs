//! TCP accept loop and per-connection handshake tasks

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::BoxedStream;
use crate::handshake::read_request_head;
use crate::pool::BufferPool;
use crate::upgrade::{StreamDecorator, UpgradeContext};

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The application callback, invoked once per successful handshake
pub(crate) type Handler =
    Arc<dyn Fn(UpgradeContext) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Everything a handshake task needs, shared across connections
pub(crate) struct ListenerSettings {
    pub(crate) handler: Handler,
    pub(crate) decorator: Option<StreamDecorator>,
    pub(crate) keep_alive: Option<Duration>,
    pub(crate) pool: Arc<BufferPool>,
}

/// Accept connections until `cancel` fires.
///
/// Accept errors are transient under load (file descriptor exhaustion,
/// resets during accept); they are logged and the loop keeps going.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    cancel: CancellationToken,
    settings: Arc<ListenerSettings>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("New connection from {}", addr);
                    let settings = settings.clone();
                    tokio::spawn(handshake_task(stream, addr, settings));
                }
                Err(err) => {
                    warn!("Accept error: {}", err);
                }
            }
        }
    }
    debug!("Accept loop stopped");
}

/// Run one connection from raw TCP through the handshake into the
/// application handler. Failures never propagate to the listener.
async fn handshake_task(stream: TcpStream, addr: SocketAddr, settings: Arc<ListenerSettings>) {
    let mut stream: BoxedStream = Box::new(stream);

    if let Some(decorate) = &settings.decorator {
        stream = match decorate(stream) {
            Ok(stream) => stream,
            Err(err) => {
                debug!("Stream decorator failed for {}: {}", addr, err);
                return;
            }
        };
    }

    let (head, leftover) = match read_request_head(&mut stream, &settings.pool).await {
        Ok(parsed) => parsed,
        Err(err) => {
            // Malformed or aborted upgrades drop the connection silently
            debug!("Handshake with {} failed: {}", addr, err);
            return;
        }
    };

    let Some(key) = head.headers().get("sec-websocket-key").map(str::to_owned) else {
        debug!("Missing Sec-WebSocket-Key from {}", addr);
        return;
    };

    let context = UpgradeContext::new(
        head,
        key,
        addr,
        stream,
        leftover,
        settings.keep_alive,
        settings.pool.clone(),
    );

    if let Err(err) = (settings.handler)(context).await {
        warn!("Connection handler error for {}: {}", addr, err);
    }
}
