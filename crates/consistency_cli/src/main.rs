//! Consistency CLI
//!
//! Command-line tools for watching resources and running a reference
//! invalidation server.
//!
//! # Commands
//!
//! - `watch` - Track resources and print every update
//! - `serve` - Run the invalidation server, invalidating URIs read from stdin
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;

/// Consistency command-line tools.
#[derive(Parser)]
#[command(name = "consistency")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track resources and print every update
    Watch {
        /// Synchronization server, as HOST:PORT or a ws:// URL
        #[arg(short, long)]
        server: String,

        /// Base URL for relative resource URLs
        #[arg(short, long)]
        base_url: Option<String>,

        /// Decode payloads as JSON
        #[arg(short, long)]
        json: bool,

        /// Seconds between reconnection attempts
        #[arg(long, default_value = "2")]
        retry_secs: u64,

        /// Resources to track, as URL or URL=URI
        #[arg(required = true)]
        resources: Vec<String>,
    },

    /// Run the invalidation server
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Maximum concurrent sessions
        #[arg(long, default_value = "1000")]
        max_sessions: usize,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Watch {
            server,
            base_url,
            json,
            retry_secs,
            resources,
        } => {
            let options = commands::watch::WatchOptions {
                server,
                base_url,
                json,
                retry_secs,
            };
            commands::watch::run(&options, &resources).await?;
        }
        Commands::Serve { bind, max_sessions } => {
            commands::serve::run(bind, max_sessions).await?;
        }
        Commands::Version => {
            println!("Consistency CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
