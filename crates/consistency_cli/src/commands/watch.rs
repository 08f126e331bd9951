//! Watch command implementation.

use consistency_engine::{
    Client, ClientConfig, ConnectionState, Endpoint, FetchConfig, HttpFetcher, PayloadDecoder,
    ResourceData, ResourceOptions, UpdateListener, WsConnector,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Options for the watch command.
#[derive(Debug)]
pub struct WatchOptions {
    /// `HOST:PORT` or a `ws://` / `wss://` URL.
    pub server: String,
    /// Base URL for relative resource URLs.
    pub base_url: Option<String>,
    /// Decode payloads as JSON.
    pub json: bool,
    /// Seconds between reconnection attempts.
    pub retry_secs: u64,
}

/// One `URL` or `URL=URI` argument.
#[derive(Debug, PartialEq, Eq)]
pub struct ResourceArg {
    /// Where the resource is fetched from.
    pub url: String,
    /// Identity on the channel, if different from the URL.
    pub uri: Option<String>,
}

/// Parses a resource argument.
///
/// The URI follows the last `=`, unless that `=` separates a query
/// parameter from its value (`/api/items?page=2`).
pub fn parse_resource(arg: &str) -> Result<ResourceArg, String> {
    let (url, uri) = match arg.rsplit_once('=') {
        Some((url, uri)) if !ends_in_query_key(url) => (url, Some(uri)),
        _ => (arg, None),
    };
    if url.is_empty() {
        return Err(format!("empty resource URL in {:?}", arg));
    }
    if uri.is_some_and(str::is_empty) {
        return Err(format!("empty resource URI in {:?}", arg));
    }
    Ok(ResourceArg {
        url: url.to_string(),
        uri: uri.map(str::to_string),
    })
}

/// True if `prefix` stops right after a query parameter name.
fn ends_in_query_key(prefix: &str) -> bool {
    match prefix.split_once('?') {
        Some((_, query)) => query
            .rsplit('&')
            .next()
            .is_some_and(|param| !param.contains('=')),
        None => false,
    }
}

/// Parses `HOST:PORT` or a full WebSocket URL.
pub fn parse_server(server: &str) -> Result<Endpoint, Box<dyn std::error::Error>> {
    if server.contains("://") {
        return Ok(Endpoint::parse(server)?);
    }
    let (host, port) = server
        .rsplit_once(':')
        .ok_or_else(|| format!("expected HOST:PORT, got {:?}", server))?;
    let port: u16 = port
        .parse()
        .map_err(|e| format!("invalid port in {:?}: {}", server, e))?;
    Ok(Endpoint::from_host_port(host, port)?)
}

/// Runs the watch command until interrupted.
pub async fn run(
    options: &WatchOptions,
    resources: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = parse_server(&options.server)?;
    let args = resources
        .iter()
        .map(|arg| parse_resource(arg))
        .collect::<Result<Vec<_>, _>>()?;

    let config = ClientConfig::new().with_endpoint(endpoint.clone());
    let config = if options.json {
        config
            .with_default_decoder(PayloadDecoder::Json)
            .with_default_response_type("application/json")
    } else {
        config.with_default_decoder(PayloadDecoder::Text)
    };

    let mut fetch_config = FetchConfig::new();
    if let Some(base_url) = &options.base_url {
        fetch_config = fetch_config.with_base_url(base_url.clone());
    }

    let client = Client::new(config, WsConnector::new()?, HttpFetcher::new(fetch_config)?);

    for arg in args {
        let mut resource_options = ResourceOptions::new(arg.url);
        if let Some(uri) = arg.uri {
            resource_options = resource_options.with_uri(uri);
        }
        let uri = resource_options.resolved_uri().to_string();
        let listener: Arc<dyn UpdateListener> =
            Arc::new(move |data: &ResourceData| println!("{} {}", uri, data));
        client.resource(resource_options.with_update_listener(listener));
    }

    info!(server = %endpoint, resources = client.resource_count(), "watching");
    client.start_endpoint(endpoint)?;

    let mut retry = tokio::time::interval(Duration::from_secs(options.retry_secs.max(1)));
    retry.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = retry.tick() => {
                if matches!(client.state(), ConnectionState::Closed | ConnectionState::Errored) {
                    if let Some(error) = client.last_error() {
                        warn!(%error, "channel down, reconnecting");
                    } else {
                        info!("channel closed, reconnecting");
                    }
                    if let Err(e) = client.reconnect() {
                        warn!(error = %e, "reconnect failed");
                    }
                }
            }
        }
    }

    client.stop();
    let stats = client.stats();
    info!(
        opens = stats.opens,
        invalidations = stats.invalidations_received,
        fetches = stats.fetches_started,
        fetch_failures = stats.fetch_failures,
        "stopped"
    );
    Ok(())
}
