//! Server configuration.

use std::net::SocketAddr;

/// Configuration for the invalidation server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sessions.
    pub max_sessions: usize,
    /// Frames queued per session before invalidations are dropped.
    pub outbound_buffer: usize,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_sessions: 1000,
            outbound_buffer: 256,
        }
    }

    /// Sets the maximum concurrent sessions.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Sets the per-session outbound queue size.
    pub fn with_outbound_buffer(mut self, size: usize) -> Self {
        self.outbound_buffer = size.max(1);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}
