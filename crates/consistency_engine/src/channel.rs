//! Duplex channel abstraction.
//!
//! The engine never talks to a socket directly. A [`Connector`] opens a
//! [`Channel`] and reports its lifecycle through the [`ChannelEvents`] it was
//! handed. This keeps the engine testable with [`MockConnector`] and lets
//! [`WsConnector`](crate::WsConnector) provide the real WebSocket transport.

use crate::config::Endpoint;
use crate::error::{SyncError, SyncResult};
use consistency_protocol::ClientMessage;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Identifies one connection attempt.
///
/// Every `start` allocates a new id, so events from an abandoned channel can
/// be told apart from events of the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) u64);

impl ChannelId {
    /// Returns the numeric id.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An open (or opening) duplex message channel.
pub trait Channel: Send + Sync {
    /// Writes a text frame.
    fn send(&self, text: &str) -> SyncResult<()>;

    /// Returns true if the channel is ready to carry frames.
    fn is_open(&self) -> bool;

    /// Closes the channel. Closing twice is a no-op.
    fn close(&self);
}

/// Opens channels to a synchronization server.
pub trait Connector: Send + Sync {
    /// Begins connecting to `endpoint`.
    ///
    /// The returned channel is not usable until `events.opened()` fires.
    /// Implementations must not deliver events synchronously from inside this
    /// call; doing so from another thread is fine.
    fn connect(&self, endpoint: &Endpoint, events: ChannelEvents) -> SyncResult<Box<dyn Channel>>;
}

/// Receiver of channel lifecycle events.
pub(crate) trait ChannelListener: Send + Sync {
    fn on_open(&self, id: ChannelId);
    fn on_close(&self, id: ChannelId);
    fn on_error(&self, id: ChannelId, reason: &str);
    fn on_message(&self, id: ChannelId, text: &str);
}

/// Event sink handed to a [`Connector`] for one connection attempt.
///
/// Events are dropped silently once the owning client is gone.
#[derive(Clone)]
pub struct ChannelEvents {
    id: ChannelId,
    listener: Weak<dyn ChannelListener>,
}

impl ChannelEvents {
    pub(crate) fn new(id: ChannelId, listener: Weak<dyn ChannelListener>) -> Self {
        Self { id, listener }
    }

    /// Returns the id of the connection attempt this sink belongs to.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Reports that the channel is open.
    pub fn opened(&self) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_open(self.id);
        }
    }

    /// Reports that the channel closed.
    pub fn closed(&self) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_close(self.id);
        }
    }

    /// Reports a transport error.
    pub fn errored(&self, reason: impl AsRef<str>) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_error(self.id, reason.as_ref());
        }
    }

    /// Delivers an inbound text frame.
    pub fn message(&self, text: impl AsRef<str>) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_message(self.id, text.as_ref());
        }
    }
}

impl fmt::Debug for ChannelEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEvents").field("id", &self.id).finish()
    }
}

#[derive(Debug, Default)]
struct MockChannelState {
    sent: Mutex<Vec<String>>,
    open: AtomicBool,
    close_calls: Mutex<u32>,
}

/// A channel that records every frame written to it.
#[derive(Debug, Clone)]
pub struct MockChannel {
    state: Arc<MockChannelState>,
}

impl MockChannel {
    /// Creates an open mock channel.
    pub fn new() -> Self {
        let state = MockChannelState::default();
        state.open.store(true, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
        }
    }

    /// Returns every frame sent so far.
    pub fn sent(&self) -> Vec<String> {
        self.state.sent.lock().clone()
    }

    /// Returns every frame sent so far, decoded.
    pub fn sent_messages(&self) -> Vec<ClientMessage> {
        self.sent()
            .iter()
            .filter_map(|text| ClientMessage::decode(text).ok().flatten())
            .collect()
    }

    /// Forgets the recorded frames.
    pub fn clear(&self) {
        self.state.sent.lock().clear();
    }

    /// Overrides the readiness flag.
    pub fn set_open(&self, open: bool) {
        self.state.open.store(open, Ordering::SeqCst);
    }

    /// Number of times `close` was called.
    pub fn close_calls(&self) -> u32 {
        *self.state.close_calls.lock()
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for MockChannel {
    fn send(&self, text: &str) -> SyncResult<()> {
        if !self.is_open() {
            return Err(SyncError::NotConnected);
        }
        self.state.sent.lock().push(text.to_string());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        *self.state.close_calls.lock() += 1;
        self.state.open.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct MockConnectorState {
    attempts: Vec<(Endpoint, ChannelEvents, MockChannel)>,
    fail_next: Option<String>,
}

/// A connector that hands out [`MockChannel`]s and lets the test drive
/// their events.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockConnectorState>>,
}

impl MockConnector {
    /// Creates a new mock connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `connect` call fail with a transport error.
    pub fn fail_next_connect(&self, message: impl Into<String>) {
        self.state.lock().fail_next = Some(message.into());
    }

    /// Number of successful `connect` calls.
    pub fn connect_count(&self) -> usize {
        self.state.lock().attempts.len()
    }

    /// Endpoint of the most recent connection attempt.
    pub fn last_endpoint(&self) -> Option<Endpoint> {
        self.state.lock().attempts.last().map(|(e, _, _)| e.clone())
    }

    /// Event sink of the most recent connection attempt.
    pub fn last_events(&self) -> Option<ChannelEvents> {
        self.state.lock().attempts.last().map(|(_, ev, _)| ev.clone())
    }

    /// Channel of the most recent connection attempt.
    pub fn last_channel(&self) -> Option<MockChannel> {
        self.state.lock().attempts.last().map(|(_, _, ch)| ch.clone())
    }

    /// Event sink of the `index`-th connection attempt.
    pub fn events(&self, index: usize) -> Option<ChannelEvents> {
        self.state.lock().attempts.get(index).map(|(_, ev, _)| ev.clone())
    }

    /// Channel of the `index`-th connection attempt.
    pub fn channel(&self, index: usize) -> Option<MockChannel> {
        self.state.lock().attempts.get(index).map(|(_, _, ch)| ch.clone())
    }
}

impl Connector for MockConnector {
    fn connect(&self, endpoint: &Endpoint, events: ChannelEvents) -> SyncResult<Box<dyn Channel>> {
        let mut state = self.state.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(SyncError::transport_retryable(message));
        }
        let channel = MockChannel::new();
        state
            .attempts
            .push((endpoint.clone(), events, channel.clone()));
        Ok(Box::new(channel))
    }
}
