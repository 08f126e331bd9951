//! Engine over a real WebSocket connection to the reference server.

use consistency_engine::{
    Client, ClientConfig, ConnectionState, Endpoint, FetchOutcome, MockFetcher, ResourceOptions,
    WsConnector,
};
use consistency_server::{InvalidationServer, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let waited = timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

async fn start_server() -> (InvalidationServer, Endpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = InvalidationServer::new(ServerConfig::new(addr));
    let runner = server.clone();
    tokio::spawn(async move { runner.run_on(listener).await });
    let endpoint = Endpoint::from_host_port(&addr.ip().to_string(), addr.port()).unwrap();
    (server, endpoint)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalidation_over_websocket_triggers_refetch() {
    let (server, endpoint) = start_server().await;
    let fetcher = MockFetcher::new();
    let client = Client::new(ClientConfig::new(), WsConnector::new().unwrap(), fetcher.clone());

    let resource = client.resource(ResourceOptions::new("/api/items/1"));
    assert_eq!(fetcher.request_count(), 1);
    fetcher.complete_latest(FetchOutcome::ok("v1"));

    client.start_endpoint(endpoint).unwrap();
    wait_for("open", || client.is_bound()).await;

    let hub = Arc::clone(server.hub());
    wait_for("watch", || hub.watchers("/api/items/1").len() == 1).await;

    assert_eq!(server.invalidate("/api/items/1").unwrap(), 1);
    wait_for("refetch", || fetcher.request_count() == 2).await;
    fetcher.complete_latest(FetchOutcome::ok("v2"));

    assert_eq!(
        resource.data().unwrap().as_bytes().unwrap().as_ref(),
        b"v2"
    );

    client.stop();
    assert_eq!(client.state(), ConnectionState::Closed);
    wait_for("session cleanup", || hub.session_count() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_server_reports_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = Client::new(
        ClientConfig::new(),
        WsConnector::new().unwrap(),
        MockFetcher::new(),
    );
    client.start("127.0.0.1", addr.port()).unwrap();

    wait_for("error", || client.state() == ConnectionState::Errored).await;
    assert!(client.has_error());
    assert!(client.last_error().is_some());
    assert!(!client.is_bound());
}
