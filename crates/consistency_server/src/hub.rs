//! Session and subscription bookkeeping.
//!
//! The hub knows which session watches which URI. It does no I/O itself:
//! every session hands in a [`SessionSink`] and the hub pushes encoded
//! `invalidate` frames into it.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use consistency_protocol::{ClientMessage, ServerMessage};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Identifies one connected client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Raw numeric value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Outbound side of a session.
pub trait SessionSink: Send + Sync {
    /// Queues a frame for the client. Returns false if it was dropped.
    fn deliver(&self, frame: &str) -> bool;
}

impl SessionSink for mpsc::Sender<String> {
    fn deliver(&self, frame: &str) -> bool {
        self.try_send(frame.to_string()).is_ok()
    }
}

impl SessionSink for mpsc::UnboundedSender<String> {
    fn deliver(&self, frame: &str) -> bool {
        self.send(frame.to_string()).is_ok()
    }
}

struct Session {
    sink: Arc<dyn SessionSink>,
    watching: BTreeSet<String>,
}

#[derive(Default)]
struct HubState {
    sessions: HashMap<SessionId, Session>,
    watchers: BTreeMap<String, BTreeSet<SessionId>>,
}

impl HubState {
    fn session_mut(&mut self, id: SessionId) -> ServerResult<&mut Session> {
        self.sessions
            .get_mut(&id)
            .ok_or(ServerError::UnknownSession(id.get()))
    }
}

/// Routes invalidations to the sessions watching a URI.
///
/// # Example
///
/// ```
/// use consistency_server::InvalidationHub;
/// use tokio::sync::mpsc;
///
/// let hub = InvalidationHub::default();
/// let (tx, mut rx) = mpsc::unbounded_channel::<String>();
/// let session = hub.open_session(tx).unwrap();
///
/// hub.handle_message(session, r#"{"message":"watch","data":{"uri":"/items/1"}}"#)
///     .unwrap();
/// assert_eq!(hub.invalidate("/items/1").unwrap(), 1);
/// assert!(rx.try_recv().unwrap().contains("invalidate"));
/// ```
pub struct InvalidationHub {
    max_sessions: usize,
    state: RwLock<HubState>,
    next_id: AtomicU64,
}

impl InvalidationHub {
    /// Creates a hub that accepts at most `max_sessions` sessions.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions,
            state: RwLock::new(HubState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Creates a hub with the limits from `config`.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.max_sessions)
    }

    /// Registers a new session.
    pub fn open_session<S>(&self, sink: S) -> ServerResult<SessionId>
    where
        S: SessionSink + 'static,
    {
        let mut state = self.state.write();
        if state.sessions.len() >= self.max_sessions {
            return Err(ServerError::TooManySessions {
                max: self.max_sessions,
            });
        }

        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        state.sessions.insert(
            id,
            Session {
                sink: Arc::new(sink),
                watching: BTreeSet::new(),
            },
        );
        debug!(session = %id, "session opened");
        Ok(id)
    }

    /// Removes a session and all of its subscriptions.
    ///
    /// Returns false if the session was not open.
    pub fn close_session(&self, id: SessionId) -> bool {
        let mut state = self.state.write();
        let Some(session) = state.sessions.remove(&id) else {
            return false;
        };

        for uri in &session.watching {
            if let Some(watchers) = state.watchers.get_mut(uri) {
                watchers.remove(&id);
                if watchers.is_empty() {
                    state.watchers.remove(uri);
                }
            }
        }
        debug!(session = %id, dropped = session.watching.len(), "session closed");
        true
    }

    /// Applies one text frame received from a session.
    ///
    /// Malformed frames are client errors. Well-formed frames of a kind the
    /// hub does not handle are ignored.
    pub fn handle_message(&self, id: SessionId, text: &str) -> ServerResult<()> {
        match ClientMessage::decode(text)? {
            Some(ClientMessage::Watch(payload)) => {
                self.watch(id, &payload.uri)?;
            }
            Some(ClientMessage::Unwatch(payload)) => {
                self.unwatch(id, &payload.uri)?;
            }
            None => {
                trace!(session = %id, "ignoring unhandled message kind");
            }
        }
        Ok(())
    }

    /// Subscribes a session to `uri`. Returns true if it was not yet watching.
    pub fn watch(&self, id: SessionId, uri: &str) -> ServerResult<bool> {
        let mut state = self.state.write();
        let added = state.session_mut(id)?.watching.insert(uri.to_string());
        if added {
            state
                .watchers
                .entry(uri.to_string())
                .or_default()
                .insert(id);
            trace!(session = %id, uri, "watch");
        }
        Ok(added)
    }

    /// Unsubscribes a session from `uri`. Returns true if it was watching.
    pub fn unwatch(&self, id: SessionId, uri: &str) -> ServerResult<bool> {
        let mut state = self.state.write();
        let removed = state.session_mut(id)?.watching.remove(uri);
        if removed {
            if let Some(watchers) = state.watchers.get_mut(uri) {
                watchers.remove(&id);
                if watchers.is_empty() {
                    state.watchers.remove(uri);
                }
            }
            trace!(session = %id, uri, "unwatch");
        }
        Ok(removed)
    }

    /// Sends `invalidate{uri}` to every session watching `uri`.
    ///
    /// Returns how many sessions accepted the frame.
    pub fn invalidate(&self, uri: &str) -> ServerResult<usize> {
        let frame = ServerMessage::invalidate(uri).encode()?;

        let targets: Vec<(SessionId, Arc<dyn SessionSink>)> = {
            let state = self.state.read();
            state
                .watchers
                .get(uri)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| {
                            state
                                .sessions
                                .get(id)
                                .map(|session| (*id, Arc::clone(&session.sink)))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut delivered = 0;
        for (id, sink) in targets {
            if sink.deliver(&frame) {
                delivered += 1;
            } else {
                warn!(session = %id, uri, "dropped invalidation, session queue unavailable");
            }
        }
        debug!(uri, delivered, "invalidated");
        Ok(delivered)
    }

    /// Sessions currently watching `uri`, in id order.
    pub fn watchers(&self, uri: &str) -> Vec<SessionId> {
        self.state
            .read()
            .watchers
            .get(uri)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// URIs a session watches.
    pub fn watched_uris(&self, id: SessionId) -> ServerResult<Vec<String>> {
        let state = self.state.read();
        let session = state
            .sessions
            .get(&id)
            .ok_or(ServerError::UnknownSession(id.get()))?;
        Ok(session.watching.iter().cloned().collect())
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.state.read().sessions.len()
    }
}

impl Default for InvalidationHub {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

impl fmt::Debug for InvalidationHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("InvalidationHub")
            .field("max_sessions", &self.max_sessions)
            .field("sessions", &state.sessions.len())
            .field("watched_uris", &state.watchers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(hub: &InvalidationHub) -> (SessionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (hub.open_session(tx).unwrap(), rx)
    }

    fn watch_frame(uri: &str) -> String {
        ClientMessage::watch(uri).encode().unwrap()
    }

    #[test]
    fn invalidate_reaches_only_watchers() {
        let hub = InvalidationHub::default();
        let (a, mut rx_a) = session(&hub);
        let (b, mut rx_b) = session(&hub);

        hub.handle_message(a, &watch_frame("/items/1")).unwrap();
        hub.handle_message(b, &watch_frame("/items/2")).unwrap();

        assert_eq!(hub.invalidate("/items/1").unwrap(), 1);

        let frame = rx_a.try_recv().unwrap();
        assert_eq!(
            ServerMessage::decode(&frame).unwrap(),
            Some(ServerMessage::invalidate("/items/1"))
        );
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn watch_is_idempotent() {
        let hub = InvalidationHub::default();
        let (a, mut rx) = session(&hub);

        assert!(hub.watch(a, "/items/1").unwrap());
        assert!(!hub.watch(a, "/items/1").unwrap());
        hub.handle_message(a, &watch_frame("/items/1")).unwrap();

        assert_eq!(hub.watchers("/items/1"), vec![a]);
        assert_eq!(hub.invalidate("/items/1").unwrap(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unwatch_stops_delivery() {
        let hub = InvalidationHub::default();
        let (a, mut rx) = session(&hub);
        hub.watch(a, "/items/1").unwrap();

        let unwatch = ClientMessage::unwatch("/items/1").encode().unwrap();
        hub.handle_message(a, &unwatch).unwrap();

        assert!(hub.watchers("/items/1").is_empty());
        assert_eq!(hub.invalidate("/items/1").unwrap(), 0);
        assert!(rx.try_recv().is_err());
        assert!(!hub.unwatch(a, "/items/1").unwrap());
    }

    #[test]
    fn close_session_drops_subscriptions() {
        let hub = InvalidationHub::default();
        let (a, _rx_a) = session(&hub);
        let (b, _rx_b) = session(&hub);
        hub.watch(a, "/items/1").unwrap();
        hub.watch(a, "/items/2").unwrap();
        hub.watch(b, "/items/1").unwrap();

        assert!(hub.close_session(a));
        assert!(!hub.close_session(a));

        assert_eq!(hub.session_count(), 1);
        assert_eq!(hub.watchers("/items/1"), vec![b]);
        assert!(hub.watchers("/items/2").is_empty());
        assert!(matches!(
            hub.watched_uris(a),
            Err(ServerError::UnknownSession(_))
        ));
    }

    #[test]
    fn malformed_frames_are_client_errors() {
        let hub = InvalidationHub::default();
        let (a, _rx) = session(&hub);

        let err = hub.handle_message(a, "not json").unwrap_err();
        assert!(err.is_client_error());

        let err = hub
            .handle_message(a, r#"{"message":"watch","data":{}}"#)
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn unknown_kinds_are_ignored() {
        let hub = InvalidationHub::default();
        let (a, _rx) = session(&hub);

        hub.handle_message(a, r#"{"message":"hello","data":{}}"#)
            .unwrap();
        assert!(hub.watched_uris(a).unwrap().is_empty());
    }

    #[test]
    fn unknown_session_is_rejected() {
        let hub = InvalidationHub::default();
        let (a, _rx) = session(&hub);
        hub.close_session(a);

        assert!(matches!(
            hub.handle_message(a, &watch_frame("/items/1")),
            Err(ServerError::UnknownSession(id)) if id == a.get()
        ));
    }

    #[test]
    fn session_limit_is_enforced() {
        let hub = InvalidationHub::new(1);
        let (_a, _rx) = session(&hub);

        let (tx, _rx2) = mpsc::unbounded_channel::<String>();
        assert!(matches!(
            hub.open_session(tx),
            Err(ServerError::TooManySessions { max: 1 })
        ));
    }

    #[test]
    fn closed_sink_is_not_counted() {
        let hub = InvalidationHub::default();
        let (a, rx_a) = session(&hub);
        let (b, _rx_b) = session(&hub);
        hub.watch(a, "/items/1").unwrap();
        hub.watch(b, "/items/1").unwrap();
        drop(rx_a);

        assert_eq!(hub.invalidate("/items/1").unwrap(), 1);
    }

    #[test]
    fn full_bounded_queue_drops_frame() {
        let hub = InvalidationHub::default();
        let (tx, mut rx) = mpsc::channel::<String>(1);
        let a = hub.open_session(tx).unwrap();
        hub.watch(a, "/items/1").unwrap();

        assert_eq!(hub.invalidate("/items/1").unwrap(), 1);
        assert_eq!(hub.invalidate("/items/1").unwrap(), 0);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn session_ids_are_unique() {
        let hub = InvalidationHub::default();
        let (a, _rx_a) = session(&hub);
        let (b, _rx_b) = session(&hub);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), format!("session-{}", a.get()));
    }
}
