//! Serve command implementation.

use consistency_server::{InvalidationServer, ServerConfig};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

/// Runs the invalidation server.
///
/// Every non-empty line on stdin is treated as a URI to invalidate. The
/// server keeps running after stdin ends.
pub async fn run(bind: SocketAddr, max_sessions: usize) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::new(bind).with_max_sessions(max_sessions);
    let server = InvalidationServer::new(config);

    let runner = server.clone();
    let mut serving = tokio::spawn(async move { runner.run().await });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            result = &mut serving => {
                result??;
                return Ok(());
            }
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => {
                    let uri = line.trim();
                    if uri.is_empty() {
                        continue;
                    }
                    let delivered = server.invalidate(uri)?;
                    println!("{} -> {} session(s)", uri, delivered);
                }
                None => {
                    info!("stdin closed, serving until interrupted");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
