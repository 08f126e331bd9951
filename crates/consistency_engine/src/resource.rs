//! Client-side copies of server entities.

use crate::client::ClientStats;
use crate::decode::{PayloadDecoder, ResourceData};
use crate::error::{SyncError, SyncResult};
use crate::fetch::{
    is_success_status, FetchCompletion, FetchHandle, FetchOutcome, FetchRequest, ResourceFetcher,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

/// Something that wants to hear about new resource values.
pub trait UpdateListener: Send + Sync {
    /// Called with the new value after every `set_data`.
    fn on_data_update(&self, data: &ResourceData);
}

impl<F> UpdateListener for F
where
    F: Fn(&ResourceData) + Send + Sync,
{
    fn on_data_update(&self, data: &ResourceData) {
        self(data)
    }
}

/// Describes a resource to track.
#[derive(Clone)]
pub struct ResourceOptions {
    /// Where to read the full state of the resource.
    pub url: String,
    /// Subscription key; defaults to `url`.
    pub uri: Option<String>,
    /// Value to seed the resource with instead of fetching it.
    pub initial_data: Option<Bytes>,
    /// Response type to negotiate when fetching.
    pub response_type: Option<String>,
    /// Decoder; defaults to the client's.
    pub decoder: Option<PayloadDecoder>,
    /// Fetcher override; defaults to the client's.
    pub fetcher: Option<Arc<dyn ResourceFetcher>>,
    /// Listeners attached before the first value is loaded.
    pub listeners: Vec<Arc<dyn UpdateListener>>,
}

impl ResourceOptions {
    /// Describes a resource read from `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            uri: None,
            initial_data: None,
            response_type: None,
            decoder: None,
            fetcher: None,
            listeners: Vec::new(),
        }
    }

    /// Describes a resource whose body is JSON.
    pub fn json(url: impl Into<String>) -> Self {
        Self::new(url)
            .with_decoder(PayloadDecoder::Json)
            .with_response_type("application/json")
    }

    /// Sets the subscription key.
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Seeds the resource instead of fetching it on creation.
    pub fn with_initial_data(mut self, data: impl Into<Bytes>) -> Self {
        self.initial_data = Some(data.into());
        self
    }

    /// Sets the response type.
    pub fn with_response_type(mut self, response_type: impl Into<String>) -> Self {
        self.response_type = Some(response_type.into());
        self
    }

    /// Sets the decoder.
    pub fn with_decoder(mut self, decoder: PayloadDecoder) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Uses a specific fetcher for this resource.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Attaches a listener when the resource is created, so it also sees
    /// the initial value. Ignored if the URI is already tracked.
    pub fn with_update_listener(mut self, listener: Arc<dyn UpdateListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// The subscription key this resource will be registered under.
    pub fn resolved_uri(&self) -> &str {
        self.uri.as_deref().unwrap_or(&self.url)
    }
}

impl fmt::Debug for ResourceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceOptions")
            .field("url", &self.url)
            .field("uri", &self.uri)
            .field("initial_data", &self.initial_data.as_ref().map(|b| b.len()))
            .field("response_type", &self.response_type)
            .field("decoder", &self.decoder)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[derive(Default)]
struct FetchSlot {
    generation: u64,
    handle: Option<Box<dyn FetchHandle>>,
    settled: bool,
}

struct ResourceInner {
    url: String,
    uri: String,
    response_type: Option<String>,
    decoder: PayloadDecoder,
    fetcher: Arc<dyn ResourceFetcher>,
    stats: Arc<RwLock<ClientStats>>,
    data: RwLock<Option<ResourceData>>,
    listeners: RwLock<Vec<Arc<dyn UpdateListener>>>,
    fetch: Mutex<FetchSlot>,
}

/// The last known value of one server entity.
///
/// `Resource` is a cheap handle; clones refer to the same instance. Use
/// [`Resource::ptr_eq`] to compare identity.
#[derive(Clone)]
pub struct Resource {
    inner: Arc<ResourceInner>,
}

impl Resource {
    pub(crate) fn new(
        url: String,
        uri: String,
        response_type: Option<String>,
        decoder: PayloadDecoder,
        fetcher: Arc<dyn ResourceFetcher>,
        stats: Arc<RwLock<ClientStats>>,
    ) -> Self {
        Self {
            inner: Arc::new(ResourceInner {
                url,
                uri,
                response_type,
                decoder,
                fetcher,
                stats,
                data: RwLock::new(None),
                listeners: RwLock::new(Vec::new()),
                fetch: Mutex::new(FetchSlot::default()),
            }),
        }
    }

    fn from_inner(inner: Arc<ResourceInner>) -> Self {
        Self { inner }
    }

    /// Returns true if both handles refer to the same instance.
    pub fn ptr_eq(a: &Resource, b: &Resource) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Fetch URL.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Subscription key.
    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    /// Declared response type.
    pub fn response_type(&self) -> Option<&str> {
        self.inner.response_type.as_deref()
    }

    /// Decoder applied to fetched bodies.
    pub fn decoder(&self) -> &PayloadDecoder {
        &self.inner.decoder
    }

    /// Current value; `None` until the first successful fetch or seed.
    pub fn data(&self) -> Option<ResourceData> {
        self.inner.data.read().clone()
    }

    /// Returns true while a fetch is outstanding.
    pub fn is_fetching(&self) -> bool {
        let slot = self.inner.fetch.lock();
        slot.handle.is_some() && !slot.settled
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Refetches the full state of the resource.
    ///
    /// Any fetch still in flight is aborted first, and its completion is
    /// discarded if it arrives anyway, so at most one fetch per resource can
    /// ever apply its result.
    pub fn fetch_resource(&self) {
        let (generation, previous) = {
            let mut slot = self.inner.fetch.lock();
            let previous = if slot.settled { None } else { slot.handle.take() };
            slot.generation += 1;
            slot.settled = false;
            slot.handle = None;
            (slot.generation, previous)
        };

        if let Some(previous) = previous {
            previous.abort();
            self.inner.stats.write().fetches_aborted += 1;
            info!(
                url = %self.inner.url,
                "request aborted: a newer version of the resource was announced"
            );
        }

        let mut request = FetchRequest::new(self.inner.url.clone());
        request.response_type = self.inner.response_type.clone();

        let weak: Weak<ResourceInner> = Arc::downgrade(&self.inner);
        let completion = FetchCompletion::new(move |outcome| {
            if let Some(inner) = weak.upgrade() {
                Resource::from_inner(inner).complete_fetch(generation, outcome);
            }
        });

        self.inner.stats.write().fetches_started += 1;
        debug!(url = %self.inner.url, generation, "fetching resource");
        let handle = self.inner.fetcher.begin(request, completion);

        let mut slot = self.inner.fetch.lock();
        if slot.generation == generation {
            if !slot.settled {
                slot.handle = Some(handle);
            }
        } else {
            // A newer fetch started while `begin` ran.
            drop(slot);
            handle.abort();
        }
    }

    fn complete_fetch(&self, generation: u64, outcome: FetchOutcome) {
        {
            let mut slot = self.inner.fetch.lock();
            if slot.generation != generation {
                debug!(
                    url = %self.inner.url,
                    generation,
                    current = slot.generation,
                    "discarding stale fetch completion"
                );
                return;
            }
            slot.settled = true;
            slot.handle = None;
        }

        match outcome {
            FetchOutcome::Success { status, body } if is_success_status(status) => {
                if let Err(e) = self.set_data(body) {
                    self.inner.stats.write().fetch_failures += 1;
                    error!(url = %self.inner.url, error = %e, "could not decode fetched resource");
                }
            }
            FetchOutcome::Success { status, .. } | FetchOutcome::Status(status) => {
                self.inner.stats.write().fetch_failures += 1;
                error!(
                    url = %self.inner.url,
                    status,
                    "request returned a non-success status; check the backend"
                );
            }
            FetchOutcome::Failed(message) => {
                self.inner.stats.write().fetch_failures += 1;
                error!(url = %self.inner.url, error = %message, "request failed");
            }
            FetchOutcome::Aborted => {
                info!(url = %self.inner.url, "request aborted");
            }
        }
    }

    /// Decodes `body` with the resource's decoder, stores it and notifies
    /// every listener.
    ///
    /// On a decode error the value is left unchanged and nobody is notified.
    pub fn set_data(&self, body: impl Into<Bytes>) -> SyncResult<()> {
        let value = self
            .inner
            .decoder
            .decode(body.into())
            .map_err(|message| SyncError::Decode {
                uri: self.inner.uri.clone(),
                message,
            })?;
        self.set_value(value);
        Ok(())
    }

    /// Stores an already decoded value and notifies every listener, even if
    /// the value did not change.
    pub fn set_value(&self, value: ResourceData) {
        *self.inner.data.write() = Some(value);
        self.update_listeners();
    }

    /// Calls every listener with the current value, in registration order.
    ///
    /// The listener list is snapshotted first, so listeners may add or remove
    /// listeners; changes apply from the next notification on.
    pub fn update_listeners(&self) {
        let Some(data) = self.data() else {
            return;
        };
        let listeners: Vec<Arc<dyn UpdateListener>> = self.inner.listeners.read().clone();
        for listener in listeners {
            listener.on_data_update(&data);
        }
    }

    /// Registers a listener.
    ///
    /// Registering the same instance twice is rejected.
    pub fn add_update_listener(&self, listener: Arc<dyn UpdateListener>) -> SyncResult<()> {
        let mut listeners = self.inner.listeners.write();
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return Err(SyncError::ListenerAlreadyRegistered);
        }
        listeners.push(listener);
        Ok(())
    }

    /// Removes a listener by identity. Returns false if it was not registered.
    pub fn remove_update_listener(&self, listener: &Arc<dyn UpdateListener>) -> bool {
        let mut listeners = self.inner.listeners.write();
        match listeners.iter().position(|l| same_listener(l, listener)) {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }
}

fn same_listener(a: &Arc<dyn UpdateListener>, b: &Arc<dyn UpdateListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("url", &self.inner.url)
            .field("uri", &self.inner.uri)
            .field("decoder", &self.inner.decoder)
            .field("has_data", &self.inner.data.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MockFetcher;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ResourceData>>,
    }

    impl UpdateListener for Recorder {
        fn on_data_update(&self, data: &ResourceData) {
            self.seen.lock().push(data.clone());
        }
    }

    fn resource(decoder: PayloadDecoder) -> (Resource, MockFetcher, Arc<RwLock<ClientStats>>) {
        let fetcher = MockFetcher::new();
        let stats = Arc::new(RwLock::new(ClientStats::default()));
        let resource = Resource::new(
            "/api/items/1".into(),
            "items:1".into(),
            Some("application/json".into()),
            decoder,
            Arc::new(fetcher.clone()),
            Arc::clone(&stats),
        );
        (resource, fetcher, stats)
    }

    #[test]
    fn options_defaults() {
        let options = ResourceOptions::new("/api/items");
        assert_eq!(options.resolved_uri(), "/api/items");
        let options = options.with_uri("items");
        assert_eq!(options.resolved_uri(), "items");

        let options = ResourceOptions::json("/a");
        assert!(matches!(options.decoder, Some(PayloadDecoder::Json)));
        assert_eq!(options.response_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn set_data_notifies_in_order_even_when_equal() {
        let (resource, _, _) = resource(PayloadDecoder::Text);
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            let listener: Arc<dyn UpdateListener> = Arc::new(move |data: &ResourceData| {
                order
                    .lock()
                    .push(format!("{}:{}", name, data.as_text().unwrap_or("")));
            });
            resource.add_update_listener(listener).unwrap();
        }

        resource.set_data("v").unwrap();
        resource.set_data("v").unwrap();

        assert_eq!(
            *order.lock(),
            vec!["first:v", "second:v", "third:v", "first:v", "second:v", "third:v"]
        );
    }

    #[test]
    fn duplicate_listener_is_rejected() {
        let (resource, _, _) = resource(PayloadDecoder::Raw);
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn UpdateListener> = recorder.clone();

        resource.add_update_listener(listener.clone()).unwrap();
        assert!(matches!(
            resource.add_update_listener(listener.clone()),
            Err(SyncError::ListenerAlreadyRegistered)
        ));
        assert_eq!(resource.listener_count(), 1);

        resource.set_data("x").unwrap();
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[test]
    fn remove_listener_by_identity() {
        let (resource, _, _) = resource(PayloadDecoder::Raw);
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let la: Arc<dyn UpdateListener> = a.clone();
        let lb: Arc<dyn UpdateListener> = b.clone();

        resource.add_update_listener(la.clone()).unwrap();
        assert!(!resource.remove_update_listener(&lb));
        resource.add_update_listener(lb.clone()).unwrap();
        assert!(resource.remove_update_listener(&la));
        assert!(!resource.remove_update_listener(&la));

        resource.set_data("x").unwrap();
        assert!(a.seen.lock().is_empty());
        assert_eq!(b.seen.lock().len(), 1);
    }

    #[test]
    fn listener_may_unregister_itself_during_dispatch() {
        let (resource, _, _) = resource(PayloadDecoder::Raw);
        let calls = Arc::new(Mutex::new(0));
        let slot: Arc<Mutex<Option<Arc<dyn UpdateListener>>>> = Arc::new(Mutex::new(None));

        let handle = resource.clone();
        let calls_in = Arc::clone(&calls);
        let slot_in = Arc::clone(&slot);
        let listener: Arc<dyn UpdateListener> = Arc::new(move |_: &ResourceData| {
            *calls_in.lock() += 1;
            if let Some(me) = slot_in.lock().take() {
                handle.remove_update_listener(&me);
            }
        });
        *slot.lock() = Some(listener.clone());
        resource.add_update_listener(listener).unwrap();

        resource.set_data("1").unwrap();
        resource.set_data("2").unwrap();
        assert_eq!(*calls.lock(), 1);
        assert_eq!(resource.listener_count(), 0);
    }

    #[test]
    fn json_decoding() {
        let (resource, _, _) = resource(PayloadDecoder::Json);
        resource.set_data(r#"{"id":1,"name":"a"}"#).unwrap();
        assert_eq!(
            resource.data().unwrap().as_json(),
            Some(&json!({"id": 1, "name": "a"}))
        );

        let err = resource.set_data("{broken").unwrap_err();
        assert!(matches!(err, SyncError::Decode { ref uri, .. } if uri == "items:1"));
        assert_eq!(
            resource.data().unwrap().as_json(),
            Some(&json!({"id": 1, "name": "a"}))
        );
    }

    #[test]
    fn fetch_success_sets_data() {
        let (resource, fetcher, stats) = resource(PayloadDecoder::Text);
        let recorder = Arc::new(Recorder::default());
        resource.add_update_listener(recorder.clone()).unwrap();

        resource.fetch_resource();
        assert!(resource.is_fetching());
        assert_eq!(
            fetcher.requests(),
            vec![FetchRequest::new("/api/items/1").with_response_type("application/json")]
        );

        fetcher.complete(0, FetchOutcome::ok("hello"));
        assert!(!resource.is_fetching());
        assert_eq!(resource.data(), Some(ResourceData::Text("hello".into())));
        assert_eq!(recorder.seen.lock().len(), 1);
        assert_eq!(stats.read().fetches_started, 1);
    }

    #[test]
    fn failed_fetch_keeps_stale_value() {
        let (resource, fetcher, stats) = resource(PayloadDecoder::Text);
        resource.set_data("old").unwrap();
        let recorder = Arc::new(Recorder::default());
        resource.add_update_listener(recorder.clone()).unwrap();

        resource.fetch_resource();
        fetcher.complete(0, FetchOutcome::Status(500));
        resource.fetch_resource();
        fetcher.complete(1, FetchOutcome::Failed("connection refused".into()));
        resource.fetch_resource();
        fetcher.complete(2, FetchOutcome::Success {
            status: 404,
            body: Bytes::from("nope"),
        });
        resource.fetch_resource();
        fetcher.complete(3, FetchOutcome::Aborted);

        assert_eq!(resource.data(), Some(ResourceData::Text("old".into())));
        assert!(recorder.seen.lock().is_empty());
        assert_eq!(stats.read().fetch_failures, 3);
    }

    #[test]
    fn refetch_aborts_previous_and_drops_its_result() {
        let (resource, fetcher, stats) = resource(PayloadDecoder::Text);
        let recorder = Arc::new(Recorder::default());
        resource.add_update_listener(recorder.clone()).unwrap();

        resource.fetch_resource();
        resource.fetch_resource();
        assert!(fetcher.was_aborted(0));
        assert!(!fetcher.was_aborted(1));
        assert_eq!(stats.read().fetches_aborted, 1);

        // The newer response lands first, then the stale one shows up anyway.
        fetcher.complete(1, FetchOutcome::ok("new"));
        fetcher.complete(0, FetchOutcome::ok("old"));

        assert_eq!(resource.data(), Some(ResourceData::Text("new".into())));
        assert_eq!(*recorder.seen.lock(), vec![ResourceData::Text("new".into())]);
    }

    #[test]
    fn completed_fetch_is_not_aborted_by_next_one() {
        let (resource, fetcher, stats) = resource(PayloadDecoder::Raw);
        resource.fetch_resource();
        fetcher.complete(0, FetchOutcome::ok("a"));
        resource.fetch_resource();
        assert!(!fetcher.was_aborted(0));
        assert_eq!(stats.read().fetches_aborted, 0);
    }

    struct ImmediateFetcher;

    impl ResourceFetcher for ImmediateFetcher {
        fn begin(&self, _request: FetchRequest, completion: FetchCompletion) -> Box<dyn FetchHandle> {
            completion.complete(FetchOutcome::ok("now"));
            Box::new(crate::fetch::DetachedHandle)
        }
    }

    #[test]
    fn synchronous_completion() {
        let stats = Arc::new(RwLock::new(ClientStats::default()));
        let resource = Resource::new(
            "/x".into(),
            "/x".into(),
            None,
            PayloadDecoder::Text,
            Arc::new(ImmediateFetcher),
            stats,
        );
        resource.fetch_resource();
        assert_eq!(resource.data(), Some(ResourceData::Text("now".into())));
        assert!(!resource.is_fetching());
    }

    #[test]
    fn identity() {
        let (a, _, _) = resource(PayloadDecoder::Raw);
        let (b, _, _) = resource(PayloadDecoder::Raw);
        assert!(Resource::ptr_eq(&a, &a.clone()));
        assert!(!Resource::ptr_eq(&a, &b));
    }
}
