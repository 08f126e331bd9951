//! # Consistency Protocol
//!
//! Wire messages exchanged between a Consistency client and its
//! synchronization server.
//!
//! This crate provides:
//! - `ClientMessage` (`watch` / `unwatch`)
//! - `ServerMessage` (`invalidate`)
//! - JSON encoding/decoding of the `{"message": .., "data": {..}}` envelope
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{ClientMessage, MessageKind, ServerMessage, UriPayload};
