//! # Consistency Server
//!
//! Reference invalidation server for Consistency clients.
//!
//! This crate provides:
//! - Session and subscription bookkeeping (`InvalidationHub`)
//! - WebSocket front end (tokio + tokio-tungstenite)
//! - `invalidate(uri)` fan-out to every session watching a URI
//!
//! # Protocol
//!
//! Clients send `watch{uri}` / `unwatch{uri}` frames; the server pushes
//! `invalidate{uri}` when the application reports a change. The server never
//! carries entity state, clients refetch it over HTTP.
//!
//! Subscriptions belong to a session. When the socket ends the session and
//! everything it watched are dropped, so clients must watch again after a
//! reconnect.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod hub;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use hub::{InvalidationHub, SessionId, SessionSink};
pub use server::{serve, serve_listener, InvalidationServer};
