//! Protocol messages.
//!
//! Every frame is a JSON object of the form
//! `{"message": "<kind>", "data": {"uri": "<subscription key>"}}`.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `data` object carried by every message kind of this protocol version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UriPayload {
    /// Subscription key of the resource.
    pub uri: String,
}

impl UriPayload {
    /// Creates a payload for the given URI.
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

/// Message kinds known to this protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Client asks to be told about changes to a URI.
    Watch,
    /// Client withdraws interest in a URI.
    Unwatch,
    /// Server reports that a URI changed.
    Invalidate,
}

impl MessageKind {
    /// Returns the wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Watch => "watch",
            MessageKind::Unwatch => "unwatch",
            MessageKind::Invalidate => "invalidate",
        }
    }

    /// Parses a wire name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "watch" => Some(MessageKind::Watch),
            "unwatch" => Some(MessageKind::Unwatch),
            "invalidate" => Some(MessageKind::Invalidate),
            _ => None,
        }
    }
}

/// Generic envelope used to peek at the kind before decoding the payload.
#[derive(Debug, Deserialize)]
struct Envelope {
    message: String,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    fn parse(text: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    fn uri_payload(self, kind: MessageKind) -> ProtocolResult<UriPayload> {
        serde_json::from_value(self.data)
            .map_err(|e| ProtocolError::invalid_payload(kind.as_str(), e.to_string()))
    }
}

/// Client to server messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message", content = "data", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Start receiving invalidations for a URI.
    Watch(UriPayload),
    /// Stop receiving invalidations for a URI.
    Unwatch(UriPayload),
}

impl ClientMessage {
    /// Creates a watch message.
    pub fn watch(uri: impl Into<String>) -> Self {
        ClientMessage::Watch(UriPayload::new(uri))
    }

    /// Creates an unwatch message.
    pub fn unwatch(uri: impl Into<String>) -> Self {
        ClientMessage::Unwatch(UriPayload::new(uri))
    }

    /// Returns the message kind.
    pub fn kind(&self) -> MessageKind {
        match self {
            ClientMessage::Watch(_) => MessageKind::Watch,
            ClientMessage::Unwatch(_) => MessageKind::Unwatch,
        }
    }

    /// Returns the URI the message refers to.
    pub fn uri(&self) -> &str {
        match self {
            ClientMessage::Watch(p) | ClientMessage::Unwatch(p) => &p.uri,
        }
    }

    /// Encodes to a JSON text frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encoding(e.to_string()))
    }

    /// Decodes a JSON text frame.
    ///
    /// Returns `Ok(None)` for well-formed frames of a kind a client never
    /// sends, so servers can ignore them.
    pub fn decode(text: &str) -> ProtocolResult<Option<Self>> {
        let envelope = Envelope::parse(text)?;
        match MessageKind::parse(&envelope.message) {
            Some(MessageKind::Watch) => {
                Ok(Some(ClientMessage::Watch(envelope.uri_payload(MessageKind::Watch)?)))
            }
            Some(MessageKind::Unwatch) => Ok(Some(ClientMessage::Unwatch(
                envelope.uri_payload(MessageKind::Unwatch)?,
            ))),
            Some(MessageKind::Invalidate) | None => Ok(None),
        }
    }
}

/// Server to client messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message", content = "data", rename_all = "lowercase")]
pub enum ServerMessage {
    /// The named resource changed on the server and should be refetched.
    Invalidate(UriPayload),
}

impl ServerMessage {
    /// Creates an invalidate message.
    pub fn invalidate(uri: impl Into<String>) -> Self {
        ServerMessage::Invalidate(UriPayload::new(uri))
    }

    /// Returns the message kind.
    pub fn kind(&self) -> MessageKind {
        match self {
            ServerMessage::Invalidate(_) => MessageKind::Invalidate,
        }
    }

    /// Returns the URI the message refers to.
    pub fn uri(&self) -> &str {
        match self {
            ServerMessage::Invalidate(p) => &p.uri,
        }
    }

    /// Encodes to a JSON text frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encoding(e.to_string()))
    }

    /// Decodes a JSON text frame.
    ///
    /// Kinds other than `invalidate` are ignored by this protocol version and
    /// decode to `Ok(None)`.
    pub fn decode(text: &str) -> ProtocolResult<Option<Self>> {
        let envelope = Envelope::parse(text)?;
        match MessageKind::parse(&envelope.message) {
            Some(MessageKind::Invalidate) => Ok(Some(ServerMessage::Invalidate(
                envelope.uri_payload(MessageKind::Invalidate)?,
            ))),
            _ => Ok(None),
        }
    }
}
