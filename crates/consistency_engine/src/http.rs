//! HTTP fetcher.
//!
//! Resources are read with a plain `GET`. Requests run as tokio tasks so an
//! invalidation arriving mid-request can abort the stale one.

use crate::config::FetchConfig;
use crate::error::{SyncError, SyncResult};
use crate::fetch::{
    DetachedHandle, FetchCompletion, FetchHandle, FetchOutcome, FetchRequest, ResourceFetcher,
};
use reqwest::header::ACCEPT;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;
use url::Url;

/// Fetches resources over HTTP with reqwest.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Option<Url>,
    runtime: Handle,
}

impl HttpFetcher {
    /// Creates a fetcher bound to the current tokio runtime.
    pub fn new(config: FetchConfig) -> SyncResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| SyncError::transport_fatal(format!("no tokio runtime: {}", e)))?;
        Self::with_runtime(config, runtime)
    }

    /// Creates a fetcher that spawns its requests on `runtime`.
    pub fn with_runtime(config: FetchConfig, runtime: Handle) -> SyncResult<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| SyncError::transport_fatal(format!("invalid base URL: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| SyncError::transport_fatal(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            runtime,
        })
    }

    /// Resolves a resource URL against the base URL.
    ///
    /// Absolute URLs are used as given; relative ones need a base URL.
    pub fn resolve(&self, url: &str) -> SyncResult<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base_url {
                Some(base) => base.join(url).map_err(|e| SyncError::Fetch {
                    url: url.to_string(),
                    message: e.to_string(),
                }),
                None => Err(SyncError::Fetch {
                    url: url.to_string(),
                    message: "relative URL and no base URL configured".into(),
                }),
            },
            Err(e) => Err(SyncError::Fetch {
                url: url.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

struct TaskHandle(JoinHandle<()>);

impl FetchHandle for TaskHandle {
    fn abort(&self) {
        self.0.abort();
    }
}

impl ResourceFetcher for HttpFetcher {
    fn begin(&self, request: FetchRequest, completion: FetchCompletion) -> Box<dyn FetchHandle> {
        let url = match self.resolve(&request.url) {
            Ok(url) => url,
            Err(e) => {
                completion.complete(FetchOutcome::Failed(e.to_string()));
                return Box::new(DetachedHandle);
            }
        };

        let mut builder = self.client.get(url.clone());
        if let Some(response_type) = &request.response_type {
            builder = builder.header(ACCEPT, response_type.as_str());
        }

        let task = self.runtime.spawn(async move {
            trace!(url = %url, "GET");
            let outcome = match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        match response.bytes().await {
                            Ok(body) => FetchOutcome::Success {
                                status: status.as_u16(),
                                body,
                            },
                            Err(e) => FetchOutcome::Failed(e.to_string()),
                        }
                    } else {
                        FetchOutcome::Status(status.as_u16())
                    }
                }
                Err(e) => FetchOutcome::Failed(e.to_string()),
            };
            completion.complete(outcome);
        });

        Box::new(TaskHandle(task))
    }
}
