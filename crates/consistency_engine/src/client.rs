//! The synchronization client: resource registry plus connection wiring.

use crate::channel::{ChannelId, ChannelListener, Connector};
use crate::config::{ClientConfig, Endpoint};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{SyncError, SyncResult};
use crate::fetch::ResourceFetcher;
use crate::registry::{ResourceKey, ResourceRegistry};
use crate::resource::{Resource, ResourceOptions};
use consistency_protocol::{ClientMessage, ServerMessage};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Counters describing what a client has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Channel opens (first open and every reconnect).
    pub opens: u64,
    /// Transport errors reported by the channel.
    pub channel_errors: u64,
    /// `watch` messages written.
    pub watches_sent: u64,
    /// `unwatch` messages written.
    pub unwatches_sent: u64,
    /// `invalidate` messages received.
    pub invalidations_received: u64,
    /// `invalidate` messages naming a URI nobody tracks.
    pub untracked_invalidations: u64,
    /// Fetches started.
    pub fetches_started: u64,
    /// In-flight fetches aborted by a newer one.
    pub fetches_aborted: u64,
    /// Fetches that failed or returned an undecodable body.
    pub fetch_failures: u64,
}

struct ClientInner {
    config: ClientConfig,
    connection: ConnectionManager,
    registry: ResourceRegistry,
    /// Serializes registry membership changes (and their watch/unwatch)
    /// against the re-subscription sweep. Taken before any connection lock.
    membership: Mutex<()>,
    fetcher: Arc<dyn ResourceFetcher>,
    stats: Arc<RwLock<ClientStats>>,
}

/// One synchronization session.
///
/// Owns the channel to the synchronization server and the set of tracked
/// resources. `Client` is a cheap handle; clone it to share the session.
/// Independent sessions are simply independent clients.
///
/// # Example
///
/// ```
/// use consistency_engine::{Client, ClientConfig, MockConnector, MockFetcher, ResourceOptions};
///
/// let fetcher = MockFetcher::new();
/// let client = Client::new(ClientConfig::new(), MockConnector::new(), fetcher.clone());
///
/// let items = client.resource(ResourceOptions::json("/api/items/1").with_uri("items:1"));
/// let again = client.resource(ResourceOptions::json("/api/items/1").with_uri("items:1"));
/// assert!(consistency_engine::Resource::ptr_eq(&items, &again));
/// assert_eq!(fetcher.request_count(), 1);
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a client.
    pub fn new<C, F>(config: ClientConfig, connector: C, fetcher: F) -> Self
    where
        C: Connector + 'static,
        F: ResourceFetcher + 'static,
    {
        Self::with_shared(config, Arc::new(connector), Arc::new(fetcher))
    }

    /// Creates a client from shared connector and fetcher instances.
    pub fn with_shared(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                connection: ConnectionManager::new(connector),
                registry: ResourceRegistry::new(),
                membership: Mutex::new(()),
                fetcher,
                stats: Arc::new(RwLock::new(ClientStats::default())),
            }),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // --- connection ---

    /// Connects to `ws://host:port`.
    pub fn start(&self, host: &str, port: u16) -> SyncResult<()> {
        self.start_endpoint(Endpoint::from_host_port(host, port)?)
    }

    /// Connects to an endpoint.
    ///
    /// Fails with `AlreadyStarted` while connecting or open.
    pub fn start_endpoint(&self, endpoint: Endpoint) -> SyncResult<()> {
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let listener: Weak<dyn ChannelListener> = weak;
        self.inner.connection.start(endpoint, listener).map(|_| ())
    }

    /// Connects again to the last endpoint used, or the configured one.
    ///
    /// The engine never reconnects by itself; this is the hook for whatever
    /// reconnection policy the application runs.
    pub fn reconnect(&self) -> SyncResult<()> {
        let endpoint = self
            .inner
            .connection
            .endpoint()
            .or_else(|| self.inner.config.endpoint.clone())
            .ok_or_else(|| SyncError::InvalidEndpoint("no endpoint to reconnect to".into()))?;
        self.start_endpoint(endpoint)
    }

    /// Closes the channel if there is one. In-flight fetches are left to
    /// complete.
    pub fn stop(&self) {
        self.inner.connection.stop();
    }

    /// Returns true iff the channel exists and is open.
    pub fn is_bound(&self) -> bool {
        self.inner.connection.is_bound()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Returns true if the last channel reported an error and has not
    /// reopened since.
    pub fn has_error(&self) -> bool {
        self.inner.connection.last_error().is_some()
    }

    /// The last channel error, cleared on the next successful open.
    pub fn last_error(&self) -> Option<String> {
        self.inner.connection.last_error()
    }

    /// Endpoint of the current or last connection.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.connection.endpoint()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ClientStats {
        self.inner.stats.read().clone()
    }

    // --- registry ---

    /// Returns the resource tracked under the options' URI, or creates,
    /// registers and loads a new one.
    ///
    /// An existing resource is returned untouched; the options are ignored.
    /// A new one gets the listeners from the options, then is seeded with
    /// `initial_data` if given (one notification), otherwise its first fetch
    /// starts immediately.
    pub fn resource(&self, options: ResourceOptions) -> Resource {
        let uri = options.resolved_uri().to_string();
        let guard = self.inner.membership.lock();
        let (resource, created) = self.inner.registry.get_or_insert_with(&uri, || {
            Resource::new(
                options.url.clone(),
                uri.clone(),
                options
                    .response_type
                    .clone()
                    .or_else(|| self.inner.config.default_response_type.clone()),
                options
                    .decoder
                    .clone()
                    .unwrap_or_else(|| self.inner.config.default_decoder.clone()),
                options
                    .fetcher
                    .clone()
                    .unwrap_or_else(|| Arc::clone(&self.inner.fetcher)),
                Arc::clone(&self.inner.stats),
            )
        });

        if !created {
            return resource;
        }

        debug!(uri = %uri, url = %resource.url(), "tracking new resource");
        if self.is_bound() {
            self.inner.bind_resource(&resource);
        }
        // Loading may call listeners synchronously; they are free to touch
        // the registry again.
        drop(guard);

        for listener in options.listeners {
            if let Err(e) = resource.add_update_listener(listener) {
                warn!(uri = %uri, error = %e, "listener not attached");
            }
        }

        match options.initial_data {
            Some(initial) => {
                if let Err(e) = resource.set_data(initial) {
                    warn!(uri = %uri, error = %e, "initial data rejected, fetching instead");
                    resource.fetch_resource();
                }
            }
            None => resource.fetch_resource(),
        }
        resource
    }

    /// Tracks a resource that was removed earlier.
    ///
    /// Returns false, changing nothing, if its URI is already tracked.
    pub fn add_resource(&self, resource: &Resource) -> bool {
        let _guard = self.inner.membership.lock();
        if !self.inner.registry.insert(resource) {
            return false;
        }
        if self.is_bound() {
            self.inner.bind_resource(resource);
        }
        true
    }

    /// Exact-match lookup by URI.
    pub fn get_resource(&self, uri: &str) -> Option<Resource> {
        self.inner.registry.get(uri)
    }

    /// Stops tracking a resource, given by URI or instance.
    ///
    /// While connected an `unwatch` is sent before the mapping forgets the
    /// resource; while disconnected nothing is sent.
    pub fn remove_resource<'a>(&self, key: impl Into<ResourceKey<'a>>) -> Option<Resource> {
        let key = key.into();
        let _guard = self.inner.membership.lock();
        self.inner.registry.find(key)?;
        if self.is_bound() {
            self.inner.unbind_uri(key.uri());
        }
        let removed = self.inner.registry.remove(key);
        if let Some(resource) = &removed {
            debug!(uri = %resource.uri(), "resource no longer tracked");
        }
        removed
    }

    /// Number of tracked resources.
    pub fn resource_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// URIs of all tracked resources, sorted.
    pub fn uris(&self) -> Vec<String> {
        self.inner.registry.uris()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("resources", &self.resource_count())
            .finish()
    }
}

impl ClientInner {
    fn bind_resource(&self, resource: &Resource) {
        match self.connection.send(&ClientMessage::watch(resource.uri())) {
            Ok(()) => {
                self.stats.write().watches_sent += 1;
                debug!(uri = %resource.uri(), "watch sent");
            }
            Err(e) => warn!(uri = %resource.uri(), error = %e, "watch not sent"),
        }
    }

    fn unbind_uri(&self, uri: &str) {
        match self.connection.send(&ClientMessage::unwatch(uri)) {
            Ok(()) => {
                self.stats.write().unwatches_sent += 1;
                debug!(uri = %uri, "unwatch sent");
            }
            Err(e) => warn!(uri = %uri, error = %e, "unwatch not sent"),
        }
    }

    /// Re-issues a watch for every tracked resource.
    fn rewatch_all(&self) {
        let resources = self.registry.snapshot();
        debug!(count = resources.len(), "re-subscribing tracked resources");
        for resource in &resources {
            self.bind_resource(resource);
        }
    }

    fn handle_message(&self, text: &str) {
        match ServerMessage::decode(text) {
            Ok(Some(ServerMessage::Invalidate(payload))) => {
                self.stats.write().invalidations_received += 1;
                match self.registry.get(&payload.uri) {
                    Some(resource) => {
                        debug!(uri = %payload.uri, "invalidated, refetching");
                        resource.fetch_resource();
                    }
                    None => {
                        self.stats.write().untracked_invalidations += 1;
                        warn!(
                            uri = %payload.uri,
                            "invalidation for a resource this client does not track"
                        );
                    }
                }
            }
            Ok(None) => debug!("ignoring message of unknown kind"),
            Err(e) => warn!(error = %e, "ignoring malformed message"),
        }
    }
}

impl ChannelListener for ClientInner {
    fn on_open(&self, id: ChannelId) {
        let _guard = self.membership.lock();
        if self.connection.mark_open(id) {
            self.stats.write().opens += 1;
            self.rewatch_all();
        }
    }

    fn on_close(&self, id: ChannelId) {
        self.connection.mark_closed(id);
    }

    fn on_error(&self, id: ChannelId, reason: &str) {
        if self.connection.mark_errored(id, reason) {
            self.stats.write().channel_errors += 1;
        }
    }

    fn on_message(&self, id: ChannelId, text: &str) {
        if !self.connection.is_current(id) {
            debug!(channel = %id, "dropping message from abandoned channel");
            return;
        }
        self.handle_message(text);
    }
}
