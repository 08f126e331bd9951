//! WebSocket transport using tokio-tungstenite.

use crate::channel::{Channel, ChannelEvents, Connector};
use crate::config::Endpoint;
use crate::error::{SyncError, SyncResult};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Opens WebSocket channels on a tokio runtime.
#[derive(Debug, Clone)]
pub struct WsConnector {
    runtime: Handle,
}

impl WsConnector {
    /// Creates a connector bound to the current tokio runtime.
    ///
    /// Fails if called outside a runtime.
    pub fn new() -> SyncResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| SyncError::transport_fatal(format!("no tokio runtime: {}", e)))?;
        Ok(Self { runtime })
    }

    /// Creates a connector that spawns its socket tasks on `runtime`.
    pub fn with_runtime(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl Connector for WsConnector {
    fn connect(&self, endpoint: &Endpoint, events: ChannelEvents) -> SyncResult<Box<dyn Channel>> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));

        self.runtime.spawn(run_socket(
            endpoint.as_str().to_string(),
            outbound_rx,
            events,
            Arc::clone(&open),
        ));

        Ok(Box::new(WsChannel {
            outbound: outbound_tx,
            open,
        }))
    }
}

/// Channel half kept by the engine; frames go to the socket task.
struct WsChannel {
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl Channel for WsChannel {
    fn send(&self, text: &str) -> SyncResult<()> {
        if !self.is_open() {
            return Err(SyncError::NotConnected);
        }
        self.outbound
            .send(Message::text(text.to_string()))
            .map_err(|_| SyncError::transport_retryable("socket task has exited"))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(Message::Close(None));
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

async fn run_socket(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: ChannelEvents,
    open: Arc<AtomicBool>,
) {
    let socket = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            events.errored(format!("connect to {} failed: {}", url, e));
            events.closed();
            return;
        }
    };

    open.store(true, Ordering::SeqCst);
    events.opened();

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => events.message(text.as_str()),
                Some(Ok(Message::Close(_))) | None => {
                    debug!(url = %url, "server closed the socket");
                    break;
                }
                Some(Ok(_)) => {
                    // Binary and control frames carry nothing for us.
                }
                Some(Err(e)) => {
                    open.store(false, Ordering::SeqCst);
                    events.errored(e.to_string());
                    break;
                }
            },
            message = outbound.recv() => match message {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if let Err(e) = sink.send(message).await {
                        open.store(false, Ordering::SeqCst);
                        events.errored(e.to_string());
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                None => {
                    if let Err(e) = sink.close().await {
                        warn!(url = %url, error = %e, "error closing socket");
                    }
                    break;
                }
            },
        }
    }

    open.store(false, Ordering::SeqCst);
    events.closed();
}
