//! Resource fetch abstraction.
//!
//! A fetch is a single GET-style request/response exchange. The engine starts
//! it through a [`ResourceFetcher`], keeps the returned [`FetchHandle`] so it
//! can abort the exchange, and learns the result through a
//! [`FetchCompletion`].

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// URL holding the full state of the resource.
    pub url: String,
    /// Response type to negotiate, sent as `Accept` by HTTP fetchers.
    pub response_type: Option<String>,
}

impl FetchRequest {
    /// Creates a request without a declared response type.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            response_type: None,
        }
    }

    /// Sets the response type.
    pub fn with_response_type(mut self, response_type: impl Into<String>) -> Self {
        self.response_type = Some(response_type.into());
        self
    }
}

/// Result of a fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The server answered with a body.
    Success {
        /// HTTP-style status code.
        status: u16,
        /// Response body.
        body: Bytes,
    },
    /// The server answered with a non-success status.
    Status(u16),
    /// The exchange failed at the transport level.
    Failed(String),
    /// The exchange was aborted before completing.
    Aborted,
}

impl FetchOutcome {
    /// Classifies a response by status code.
    pub fn from_response(status: u16, body: impl Into<Bytes>) -> Self {
        if is_success_status(status) {
            FetchOutcome::Success {
                status,
                body: body.into(),
            }
        } else {
            FetchOutcome::Status(status)
        }
    }

    /// Creates a `200` response.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        FetchOutcome::Success {
            status: 200,
            body: body.into(),
        }
    }
}

/// Returns true for 2xx status codes.
pub fn is_success_status(status: u16) -> bool {
    (200..300).contains(&status)
}

/// One-shot callback that reports the outcome of a fetch.
pub struct FetchCompletion {
    callback: Box<dyn FnOnce(FetchOutcome) + Send>,
}

impl FetchCompletion {
    /// Wraps a callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(FetchOutcome) + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }

    /// Reports the outcome.
    pub fn complete(self, outcome: FetchOutcome) {
        (self.callback)(outcome)
    }
}

impl fmt::Debug for FetchCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FetchCompletion")
    }
}

/// Handle to an in-flight fetch.
pub trait FetchHandle: Send + Sync {
    /// Aborts the exchange. The completion may or may not still fire.
    fn abort(&self);
}

/// Handle for fetches that already finished or cannot be aborted.
#[derive(Debug, Default)]
pub struct DetachedHandle;

impl FetchHandle for DetachedHandle {
    fn abort(&self) {}
}

/// Starts fetches.
pub trait ResourceFetcher: Send + Sync {
    /// Starts fetching `request`; `completion` must be called at most once.
    ///
    /// The completion may be called before this method returns.
    fn begin(&self, request: FetchRequest, completion: FetchCompletion) -> Box<dyn FetchHandle>;
}

struct MockFetch {
    request: FetchRequest,
    completion: Option<FetchCompletion>,
    aborted: Arc<AtomicBool>,
}

struct MockFetchHandle {
    aborted: Arc<AtomicBool>,
}

impl FetchHandle for MockFetchHandle {
    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// A fetcher that records requests and completes them only when told to.
#[derive(Clone, Default)]
pub struct MockFetcher {
    fetches: Arc<Mutex<Vec<MockFetch>>>,
}

impl MockFetcher {
    /// Creates a new mock fetcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request started so far, oldest first.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.fetches.lock().iter().map(|f| f.request.clone()).collect()
    }

    /// Number of requests started so far.
    pub fn request_count(&self) -> usize {
        self.fetches.lock().len()
    }

    /// Number of requests whose completion has not been fired.
    pub fn pending_count(&self) -> usize {
        self.fetches
            .lock()
            .iter()
            .filter(|f| f.completion.is_some())
            .count()
    }

    /// Returns true if the `index`-th request was aborted.
    pub fn was_aborted(&self, index: usize) -> bool {
        self.fetches
            .lock()
            .get(index)
            .map(|f| f.aborted.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Completes the `index`-th request. Returns false if it does not exist
    /// or was already completed.
    pub fn complete(&self, index: usize, outcome: FetchOutcome) -> bool {
        // Release the lock first: the completion may start another fetch.
        let completion = self
            .fetches
            .lock()
            .get_mut(index)
            .and_then(|f| f.completion.take());
        match completion {
            Some(completion) => {
                completion.complete(outcome);
                true
            }
            None => false,
        }
    }

    /// Completes the most recent request.
    pub fn complete_latest(&self, outcome: FetchOutcome) -> bool {
        match self.request_count().checked_sub(1) {
            Some(index) => self.complete(index, outcome),
            None => false,
        }
    }
}

impl fmt::Debug for MockFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockFetcher")
            .field("requests", &self.request_count())
            .finish()
    }
}

impl ResourceFetcher for MockFetcher {
    fn begin(&self, request: FetchRequest, completion: FetchCompletion) -> Box<dyn FetchHandle> {
        let aborted = Arc::new(AtomicBool::new(false));
        self.fetches.lock().push(MockFetch {
            request,
            completion: Some(completion),
            aborted: Arc::clone(&aborted),
        });
        Box::new(MockFetchHandle { aborted })
    }
}
