//! # Consistency Engine
//!
//! Keeps client-held copies of server entities ("resources") in sync with
//! their authoritative versions, using a persistent channel to receive
//! invalidation notices instead of polling.
//!
//! This crate provides:
//! - Connection lifecycle state machine (idle → connecting → open → closed/errored)
//! - Resource registry with re-subscription on every (re)open
//! - Invalidation → refetch → listener fan-out pipeline
//! - Payload decoding strategies (raw, text, JSON, custom)
//! - Channel and fetch abstractions, with WebSocket/HTTP implementations and
//!   test doubles
//!
//! ## Flow
//!
//! 1. `Client::resource` registers a resource and sends `watch` if the
//!    channel is open
//! 2. The server sends `invalidate{uri}` when that entity changes
//! 3. The client refetches the resource's full state
//! 4. `Resource::set_data` stores it and notifies every listener
//!
//! ## Key Invariants
//!
//! - At most one resource per (client, URI)
//! - Every tracked resource is watched again after each successful open
//! - At most one outstanding fetch per resource; stale completions are dropped
//! - Nothing is queued while the channel is closed
//! - Failures degrade to stale data plus a log line, never a panic

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod client;
mod config;
mod connection;
mod decode;
mod error;
mod fetch;
mod http;
mod registry;
mod resource;
mod ws;

pub use channel::{Channel, ChannelEvents, ChannelId, Connector, MockChannel, MockConnector};
pub use client::{Client, ClientStats};
pub use config::{ClientConfig, Endpoint, FetchConfig};
pub use connection::ConnectionState;
pub use decode::{CustomDecoder, PayloadDecoder, ResourceData};
pub use error::{SyncError, SyncResult};
pub use fetch::{
    is_success_status, DetachedHandle, FetchCompletion, FetchHandle, FetchOutcome, FetchRequest,
    MockFetcher, ResourceFetcher,
};
pub use http::HttpFetcher;
pub use registry::ResourceKey;
pub use resource::{Resource, ResourceOptions, UpdateListener};
pub use ws::WsConnector;
