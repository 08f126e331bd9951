//! Connection lifecycle state machine.
//!
//! ```text
//! Idle -> Connecting -> Open -> Closed
//!              |          \
//!              +-----------+-> Errored
//! ```
//!
//! `Closed` and `Errored` only leave through an explicit `start`. The engine
//! never reconnects on its own.

use crate::channel::{Channel, ChannelEvents, ChannelId, ChannelListener, Connector};
use crate::config::Endpoint;
use crate::error::{SyncError, SyncResult};
use consistency_protocol::ClientMessage;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

/// The current state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never started.
    Idle,
    /// A channel was requested and has not opened yet.
    Connecting,
    /// The channel is open; watches have been (re)issued.
    Open,
    /// The channel closed or was stopped.
    Closed,
    /// The channel reported a transport error.
    Errored,
}

impl ConnectionState {
    /// Returns true if `start` may be called in this state.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            ConnectionState::Idle | ConnectionState::Closed | ConnectionState::Errored
        )
    }

    /// Returns true if a channel is being opened or is open.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

struct ActiveChannel {
    id: ChannelId,
    channel: Box<dyn Channel>,
}

/// Owns the single logical channel of a client.
///
/// Lock order is `channel` before `state`.
pub(crate) struct ConnectionManager {
    connector: Arc<dyn Connector>,
    channel: Mutex<Option<ActiveChannel>>,
    state: RwLock<ConnectionState>,
    endpoint: RwLock<Option<Endpoint>>,
    last_error: RwLock<Option<String>>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub(crate) fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            channel: Mutex::new(None),
            state: RwLock::new(ConnectionState::Idle),
            endpoint: RwLock::new(None),
            last_error: RwLock::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    pub(crate) fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.read().clone()
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Opens a new channel.
    ///
    /// Fails with `AlreadyStarted` while a channel is connecting or open. A
    /// channel left over from a closed or errored attempt is closed first.
    pub(crate) fn start(
        &self,
        endpoint: Endpoint,
        listener: Weak<dyn ChannelListener>,
    ) -> SyncResult<ChannelId> {
        let mut slot = self.channel.lock();

        let state = self.state();
        if !state.can_start() {
            return Err(SyncError::AlreadyStarted {
                state: format!("{:?}", state),
            });
        }

        if let Some(stale) = slot.take() {
            debug!(channel = %stale.id, "closing abandoned channel");
            stale.channel.close();
        }

        let id = ChannelId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        *self.endpoint.write() = Some(endpoint.clone());
        self.set_state(ConnectionState::Connecting);
        info!(channel = %id, endpoint = %endpoint, "connecting");

        match self
            .connector
            .connect(&endpoint, ChannelEvents::new(id, listener))
        {
            Ok(channel) => {
                *slot = Some(ActiveChannel { id, channel });
                Ok(id)
            }
            Err(e) => {
                error!(channel = %id, endpoint = %endpoint, error = %e, "connect failed");
                *self.last_error.write() = Some(e.to_string());
                self.set_state(ConnectionState::Errored);
                Err(e)
            }
        }
    }

    /// Closes the channel, if there is one.
    pub(crate) fn stop(&self) {
        let mut slot = self.channel.lock();
        if let Some(active) = slot.take() {
            active.channel.close();
            self.set_state(ConnectionState::Closed);
            info!(channel = %active.id, "connection stopped");
        }
    }

    /// Returns true if `id` is the channel currently tracked.
    pub(crate) fn is_current(&self, id: ChannelId) -> bool {
        self.channel.lock().as_ref().map(|a| a.id) == Some(id)
    }

    /// Returns true iff a channel exists, it reported open, and the transport
    /// still considers it ready.
    pub(crate) fn is_bound(&self) -> bool {
        let slot = self.channel.lock();
        match slot.as_ref() {
            Some(active) => self.state() == ConnectionState::Open && active.channel.is_open(),
            None => false,
        }
    }

    /// Handles an open event. Returns true if the re-subscription sweep
    /// should run.
    pub(crate) fn mark_open(&self, id: ChannelId) -> bool {
        let slot = self.channel.lock();
        if slot.as_ref().map(|a| a.id) != Some(id) {
            debug!(channel = %id, "ignoring open of abandoned channel");
            return false;
        }
        self.set_state(ConnectionState::Open);
        if self.last_error.write().take().is_some() {
            info!(channel = %id, "connection recovered from previous error");
        } else {
            info!(channel = %id, "connection open");
        }
        true
    }

    /// Handles a close event.
    pub(crate) fn mark_closed(&self, id: ChannelId) {
        let mut slot = self.channel.lock();
        if slot.as_ref().map(|a| a.id) != Some(id) {
            debug!(channel = %id, "ignoring close of abandoned channel");
            return;
        }
        *slot = None;
        // An error already explains the close; keep the sticky state.
        if self.state() != ConnectionState::Errored {
            self.set_state(ConnectionState::Closed);
        }
        info!(channel = %id, "connection closed");
    }

    /// Handles an error event. Returns false if the event was stale.
    pub(crate) fn mark_errored(&self, id: ChannelId, reason: &str) -> bool {
        let slot = self.channel.lock();
        if slot.as_ref().map(|a| a.id) != Some(id) {
            debug!(channel = %id, reason, "ignoring error of abandoned channel");
            return false;
        }
        *self.last_error.write() = Some(reason.to_string());
        self.set_state(ConnectionState::Errored);
        error!(channel = %id, reason, "connection error");
        true
    }

    /// Encodes and writes a message.
    ///
    /// Nothing is queued: while the channel is not bound the message is
    /// dropped and `NotConnected` is returned.
    pub(crate) fn send(&self, message: &ClientMessage) -> SyncResult<()> {
        let text = message.encode()?;
        let slot = self.channel.lock();
        match slot.as_ref() {
            Some(active)
                if self.state() == ConnectionState::Open && active.channel.is_open() =>
            {
                active.channel.send(&text)
            }
            _ => Err(SyncError::NotConnected),
        }
    }
}
