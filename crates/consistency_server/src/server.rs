//! WebSocket front end for the invalidation hub.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::hub::{InvalidationHub, SessionId};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// The invalidation server.
///
/// Owns an [`InvalidationHub`] and exposes it to clients over WebSocket.
/// The application calls [`InvalidationServer::invalidate`] whenever an
/// entity changes.
///
/// # Example
///
/// ```
/// use consistency_server::{InvalidationServer, ServerConfig};
///
/// let server = InvalidationServer::new(ServerConfig::default());
/// assert_eq!(server.invalidate("/api/items/1").unwrap(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct InvalidationServer {
    config: ServerConfig,
    hub: Arc<InvalidationHub>,
}

impl InvalidationServer {
    /// Creates a server with a fresh hub.
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(InvalidationHub::from_config(&config));
        Self { config, hub }
    }

    /// Creates a server around an existing hub.
    pub fn with_hub(config: ServerConfig, hub: Arc<InvalidationHub>) -> Self {
        Self { config, hub }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the shared hub.
    pub fn hub(&self) -> &Arc<InvalidationHub> {
        &self.hub
    }

    /// Notifies every session watching `uri`.
    pub fn invalidate(&self, uri: &str) -> ServerResult<usize> {
        self.hub.invalidate(uri)
    }

    /// Binds `config.bind_addr` and serves until the listener fails.
    pub async fn run(&self) -> ServerResult<()> {
        serve(self.config.clone(), Arc::clone(&self.hub)).await
    }

    /// Serves connections from an already bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> ServerResult<()> {
        serve_listener(listener, self.config.clone(), Arc::clone(&self.hub)).await
    }
}

/// Binds `config.bind_addr` and serves the hub on it.
pub async fn serve(config: ServerConfig, hub: Arc<InvalidationHub>) -> ServerResult<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    serve_listener(listener, config, hub).await
}

/// Accept loop over a bound listener. Each connection becomes one session.
pub async fn serve_listener(
    listener: TcpListener,
    config: ServerConfig,
    hub: Arc<InvalidationHub>,
) -> ServerResult<()> {
    info!(addr = %listener.local_addr()?, "listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let hub = Arc::clone(&hub);
        let buffer = config.outbound_buffer;

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, hub, buffer).await {
                error!(%peer, error = %e, "connection failed");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<InvalidationHub>,
    buffer: usize,
) -> ServerResult<()> {
    let socket = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| ServerError::WebSocket(e.to_string()))?;
    let (mut sink, mut stream) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(buffer.max(1));
    let session = match hub.open_session(outbound_tx) {
        Ok(session) => session,
        Err(e) => {
            let _ = sink.send(Message::Close(None)).await;
            return Err(e);
        }
    };
    info!(%peer, %session, "client connected");

    let result = pump(&hub, session, peer, &mut sink, &mut stream, &mut outbound_rx).await;

    hub.close_session(session);
    info!(%peer, %session, "client disconnected");
    result
}

async fn pump<S, R>(
    hub: &InvalidationHub,
    session: SessionId,
    peer: SocketAddr,
    sink: &mut S,
    stream: &mut R,
    outbound: &mut mpsc::Receiver<String>,
) -> ServerResult<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = hub.handle_message(session, text.as_str()) {
                        warn!(%peer, %session, error = %e, "rejected frame");
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    sink.send(Message::Pong(data))
                        .await
                        .map_err(|e| ServerError::WebSocket(e.to_string()))?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%peer, %session, error = %e, "socket error");
                    return Ok(());
                }
            },
            queued = outbound.recv() => match queued {
                Some(frame) => {
                    sink.send(Message::text(frame))
                        .await
                        .map_err(|e| ServerError::WebSocket(e.to_string()))?;
                }
                None => return Ok(()),
            },
        }
    }
}
